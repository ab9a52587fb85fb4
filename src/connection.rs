// Copyright 2026 the hurtig authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-client connection state: socket, buffers, parser, and responder.

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::buffer::Buffer;
use crate::http::request::{HttpRequest, ParseStatus};
use crate::http::response::HttpResponse;
use crate::sql::CredentialStore;

/// Below this backlog a level-triggered writer stops looping and lets the
/// next readiness notification drain the rest.
const LT_WRITE_THRESHOLD: usize = 10 * 1024;

/// Process-wide state shared by every connection, fixed at server startup.
pub struct ConnContext {
    /// Root directory of the static resource tree.
    pub src_dir: String,
    /// Whether connection descriptors use edge-triggered readiness.
    pub is_et: bool,
    /// Credential store behind the login/register routes.
    pub store: Arc<dyn CredentialStore>,
    /// Number of live connections.
    pub user_count: AtomicI32,
}

impl fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnContext")
            .field("src_dir", &self.src_dir)
            .field("is_et", &self.is_et)
            .field("user_count", &self.user_count)
            .finish()
    }
}

/// One accepted client. Exactly one worker task touches a connection at a
/// time (one-shot registration guarantees it), so no field needs its own
/// lock.
#[derive(Debug)]
pub struct HttpConn {
    fd: Option<OwnedFd>,
    raw_fd: RawFd,
    addr: SocketAddr,
    ctx: Arc<ConnContext>,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    /// Bytes of the mapped file already handed to the kernel.
    file_sent: usize,
}

impl HttpConn {
    /// Takes ownership of an accepted socket and counts it as live.
    pub fn new(fd: OwnedFd, addr: SocketAddr, ctx: Arc<ConnContext>) -> Self {
        let raw_fd = fd.as_raw_fd();
        let count = ctx.user_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Client[{raw_fd}]({addr}) in, user count: {count}");
        Self {
            fd: Some(fd),
            raw_fd,
            addr,
            ctx,
            read_buf: Buffer::new(1024),
            write_buf: Buffer::new(1024),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            file_sent: 0,
        }
    }

    /// The socket descriptor this connection was accepted on. Stays valid
    /// as a map key after close.
    pub fn fd(&self) -> RawFd {
        self.raw_fd
    }

    /// The peer address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether [`HttpConn::close`] already ran.
    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    /// Drains the socket into the read buffer. Under edge-triggered
    /// readiness this loops until the kernel reports empty; `Ok(0)` means
    /// the peer closed.
    pub fn read(&mut self) -> io::Result<usize> {
        let Some(fd) = self.fd.as_ref().map(AsRawFd::as_raw_fd) else {
            return Ok(0);
        };
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(fd) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    total += n;
                    if !self.ctx.is_et {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Scatter-writes the pending response: headers (and any inline error
    /// body) from the write buffer, then the mapped file region.
    pub fn write(&mut self) -> io::Result<usize> {
        let Some(fd) = self.fd.as_ref().map(AsRawFd::as_raw_fd) else {
            return Err(io::Error::from(ErrorKind::NotConnected));
        };
        let mut total = 0;
        loop {
            let head_len = self.write_buf.readable_bytes();
            let head_ptr = self.write_buf.peek().as_ptr();
            let (file_ptr, file_len) = match self.response.file() {
                Some(file) if self.file_sent < file.len() => (
                    // Safety: `file_sent < file.len()` keeps the pointer in
                    // the mapping.
                    unsafe { file.as_ptr().add(self.file_sent) },
                    file.len() - self.file_sent,
                ),
                _ => (std::ptr::null(), 0),
            };
            let iov = [
                libc::iovec {
                    iov_base: head_ptr as *mut libc::c_void,
                    iov_len: head_len,
                },
                libc::iovec {
                    iov_base: file_ptr as *mut libc::c_void,
                    iov_len: file_len,
                },
            ];

            let n = match syscall!(writev(fd, iov.as_ptr(), 2)) {
                Ok(n) => n as usize,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            total += n;

            if n > head_len {
                self.file_sent += n - head_len;
                if head_len > 0 {
                    self.write_buf.retrieve_all();
                }
            } else {
                self.write_buf.retrieve(n);
            }

            if self.to_write_bytes() == 0 {
                break;
            }
            if !self.ctx.is_et && self.to_write_bytes() <= LT_WRITE_THRESHOLD {
                break;
            }
        }
        Ok(total)
    }

    /// Bytes still owed to the peer for the current response.
    pub fn to_write_bytes(&self) -> usize {
        let file_rest = self
            .response
            .file()
            .map_or(0, |f| f.len().saturating_sub(self.file_sent));
        self.write_buf.readable_bytes() + file_rest
    }

    /// Whether the current exchange keeps the connection open.
    pub fn is_keep_alive(&self) -> bool {
        self.request.is_keep_alive()
    }

    /// Feeds buffered bytes through the parser and, once a request is
    /// complete (or hopeless), assembles the response. Returns whether
    /// there is now a response to write.
    pub fn process(&mut self) -> bool {
        // A finished exchange is torn down just before the next request is
        // parsed; the previous write must have fully drained by now.
        if self.request.is_finished() {
            self.request.reset();
            self.response.unmap();
        }
        if self.read_buf.readable_bytes() == 0 {
            return false;
        }

        let store = Arc::clone(&self.ctx.store);
        match self.request.parse(&mut self.read_buf, store.as_ref()) {
            ParseStatus::NeedsMore => return false,
            ParseStatus::Finished => {
                debug!("request: {:?} {}", self.request.method(), self.request.path());
                let keep_alive = self.request.is_keep_alive();
                let path = self.request.path().to_string();
                self.response.init(&self.ctx.src_dir, &path, keep_alive, None);
            }
            ParseStatus::BadRequest => {
                let path = self.request.path().to_string();
                self.response.init(&self.ctx.src_dir, &path, false, Some(400));
            }
        }

        self.write_buf.retrieve_all();
        self.response.make_response(&mut self.write_buf);
        self.file_sent = 0;
        true
    }

    /// Releases the mapping, closes the socket, and decrements the live
    /// count. Safe to call from both a worker and the reactor; only the
    /// first call does anything.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            self.response.unmap();
            let count = self.ctx.user_count.fetch_sub(1, Ordering::SeqCst) - 1;
            info!("Client[{}]({}) quit, user count: {count}", self.raw_fd, self.addr);
            drop(fd);
        }
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    use super::{ConnContext, HttpConn};
    use crate::sql::MemoryStore;

    fn context(src_dir: &str) -> Arc<ConnContext> {
        Arc::new(ConnContext {
            src_dir: src_dir.to_string(),
            is_et: true,
            store: Arc::new(MemoryStore::with_user("alice", "s3cret")),
            user_count: AtomicI32::new(0),
        })
    }

    /// Local socket pair with a nonblocking server side.
    fn socket_pair() -> (OwnedFd, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (OwnedFd::from(server), peer, client)
    }

    /// Retries until loopback data reaches the nonblocking server side.
    fn read_some(conn: &mut HttpConn) -> usize {
        for _ in 0..200 {
            match conn.read() {
                Ok(n) if n > 0 => return n,
                Ok(_) => panic!("peer closed unexpectedly"),
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(2)),
            }
        }
        panic!("no data arrived on loopback");
    }

    #[test]
    fn counts_live_connections() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path().to_str().unwrap());

        let (fd, peer, _client) = socket_pair();
        let mut conn = HttpConn::new(fd, peer, Arc::clone(&ctx));
        assert_eq!(1, ctx.user_count.load(Ordering::SeqCst));

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(0, ctx.user_count.load(Ordering::SeqCst));
    }

    #[test]
    fn serves_a_request_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "HELLO").unwrap();
        let ctx = context(dir.path().to_str().unwrap());

        let (fd, peer, mut client) = socket_pair();
        let raw = fd.as_raw_fd();
        let mut conn = HttpConn::new(fd, peer, ctx);
        assert_eq!(raw, conn.fd());

        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(read_some(&mut conn) > 0);
        assert!(conn.process());
        assert!(conn.to_write_bytes() > 0);
        assert!(conn.is_keep_alive());

        while conn.to_write_bytes() > 0 {
            conn.write().unwrap();
        }
        conn.close();

        let mut raw_response = String::new();
        client.read_to_string(&mut raw_response).unwrap();
        assert!(raw_response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw_response.contains("Content-length: 5\r\n"));
        assert!(raw_response.ends_with("\r\n\r\nHELLO"));
    }

    #[test]
    fn process_without_input_requests_more() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path().to_str().unwrap());
        let (fd, peer, _client) = socket_pair();
        let mut conn = HttpConn::new(fd, peer, ctx);
        assert!(!conn.process());
    }

    #[test]
    fn bad_request_builds_a_400_and_drops_keep_alive() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path().to_str().unwrap());
        let (fd, peer, mut client) = socket_pair();
        let mut conn = HttpConn::new(fd, peer, ctx);

        client
            .write_all(b"BREW / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        read_some(&mut conn);
        assert!(conn.process());
        assert!(!conn.is_keep_alive());

        while conn.to_write_bytes() > 0 {
            conn.write().unwrap();
        }
        conn.close();

        let mut raw_response = String::new();
        client.read_to_string(&mut raw_response).unwrap();
        assert!(raw_response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}
