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

//! The reactor: accepts clients, waits for readiness, and hands each
//! notification to the worker pool as a task.
//!
//! The reactor thread owns the epoll instance, the heap timer, and the
//! connection table. Workers own one connection at a time (one-shot
//! registration makes that exclusive) and talk back through exactly two
//! channels: the thread-safe `Epoller::modify` re-arm, and the reaped list
//! of descriptors they closed, drained here every loop iteration.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use thiserror::Error;

use crate::config::{event_masks, Config};
use crate::connection::{ConnContext, HttpConn};
use crate::epoll::{
    Epoller, Events, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP,
};
use crate::sql::CredentialStore;
use crate::timer::HeapTimer;
use crate::worker::WorkerPool;

/// Hard cap on simultaneously served clients.
const MAX_FD: i32 = 65536;

const LISTEN_BACKLOG: libc::c_int = 6;

/// Failures that prevent the server from starting. Per-connection errors
/// never surface here; they are logged and the connection is closed.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Refusing to bind a privileged port.
    #[error("port {0} is reserved (use 1024-65535, or 0 for an ephemeral port)")]
    PortRange(u16),
    /// Creating, configuring, or binding the listen socket failed.
    #[error("listen socket setup failed: {0}")]
    Socket(#[source] io::Error),
    /// Creating the readiness interface failed.
    #[error("readiness setup failed: {0}")]
    Epoll(#[source] io::Error),
}

/// The reactor and everything it owns.
#[derive(Debug)]
pub struct Server {
    port: u16,
    listen_fd: OwnedFd,
    listen_events: u32,
    conn_events: u32,
    timeout_ms: i64,
    is_close: bool,
    timer: HeapTimer,
    pool: WorkerPool,
    epoller: Arc<Epoller>,
    events: Events,
    conns: HashMap<RawFd, Arc<Mutex<HttpConn>>>,
    ctx: Arc<ConnContext>,
    /// Descriptors closed by workers or the timer, awaiting table cleanup.
    reaped: Arc<Mutex<Vec<RawFd>>>,
}

impl Server {
    /// Binds the listen socket and sets up epoll, timer, and worker pool.
    pub fn new(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self, ServerError> {
        if config.port != 0 && config.port < 1024 {
            return Err(ServerError::PortRange(config.port));
        }
        let (listen_events, conn_events) = event_masks(config.trigger_mode);

        let listen_fd = init_socket(config).map_err(ServerError::Socket)?;
        let port = local_port(listen_fd.as_raw_fd()).map_err(ServerError::Socket)?;

        let epoller = Arc::new(Epoller::new().map_err(ServerError::Epoll)?);
        epoller
            .add(listen_fd.as_raw_fd(), listen_events | EPOLLIN)
            .map_err(ServerError::Epoll)?;

        info!("Server port: {port}");

        Ok(Self {
            port,
            listen_fd,
            listen_events,
            conn_events,
            timeout_ms: config.timeout_ms,
            is_close: false,
            timer: HeapTimer::new(),
            pool: WorkerPool::new(config.worker_count),
            epoller,
            events: Events::with_capacity(1024),
            conns: HashMap::new(),
            ctx: Arc::new(ConnContext {
                src_dir: config.src_dir.clone(),
                is_et: conn_events & EPOLLET != 0,
                store,
                user_count: AtomicI32::new(0),
            }),
            reaped: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The bound port; differs from the configured one only when that was
    /// `0`.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of live connections.
    pub fn user_count(&self) -> i32 {
        self.ctx.user_count.load(Ordering::SeqCst)
    }

    /// Runs the event loop until a fatal error.
    pub fn run(&mut self) {
        if !self.is_close {
            info!("========== Server start ==========");
        }
        while !self.is_close {
            let mut timeout_ms = -1i64;
            if self.timeout_ms > 0 {
                timeout_ms = self.timer.next_tick_ms();
            }
            self.reap_closed();

            let n = match self
                .epoller
                .wait(&mut self.events, timeout_ms.min(i32::MAX as i64) as i32)
            {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("wait for events failed: {e}");
                    self.is_close = true;
                    break;
                }
            };

            for i in 0..n {
                let fd = self.events.fd(i);
                let mask = self.events.mask(i);
                if fd == self.listen_fd.as_raw_fd() {
                    self.deal_listen();
                } else if mask & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
                    self.drop_conn(fd);
                } else if mask & EPOLLIN != 0 {
                    self.deal_read(fd);
                } else if mask & EPOLLOUT != 0 {
                    self.deal_write(fd);
                } else {
                    error!("unexpected event {mask:#x} on fd {fd}");
                }
            }
        }
    }

    fn deal_listen(&mut self) {
        loop {
            // Safety: zeroed sockaddr_in is a valid out-parameter pattern.
            let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let fd = match syscall!(accept(
                self.listen_fd.as_raw_fd(),
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len
            )) {
                Ok(fd) => fd,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept failed: {e}");
                    return;
                }
            };

            if self.ctx.user_count.load(Ordering::SeqCst) >= MAX_FD {
                send_error(fd, b"Server busy!");
                warn!("clients are full");
                return;
            }
            self.add_client(fd, peer_addr(&addr));

            if self.listen_events & EPOLLET == 0 {
                return;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: SocketAddr) {
        if let Err(e) = set_nonblocking(fd) {
            warn!("failed to make client fd {fd} nonblocking: {e}");
        }
        // Safety: `fd` is fresh from accept(2); ownership moves into the
        // connection.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let conn = Arc::new(Mutex::new(HttpConn::new(owned, addr, Arc::clone(&self.ctx))));
        self.conns.insert(fd, Arc::clone(&conn));

        if self.timeout_ms > 0 {
            let epoller = Arc::clone(&self.epoller);
            let reaped = Arc::clone(&self.reaped);
            let conn = Arc::clone(&conn);
            self.timer.add(
                fd,
                self.timeout_ms as u64,
                Box::new(move || expire_conn(fd, &conn, &epoller, &reaped)),
            );
        }

        if let Err(e) = self.epoller.add(fd, EPOLLIN | self.conn_events) {
            warn!("failed to register client fd {fd}: {e}");
            self.drop_conn(fd);
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        // Sporadic events for already-dropped descriptors happen.
        let Some(conn) = self.conns.get(&fd).cloned() else {
            return;
        };
        self.extend_time(fd);
        let epoller = Arc::clone(&self.epoller);
        let reaped = Arc::clone(&self.reaped);
        let conn_events = self.conn_events;
        self.pool
            .submit(move || on_read(&conn, &epoller, conn_events, &reaped));
    }

    fn deal_write(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get(&fd).cloned() else {
            return;
        };
        self.extend_time(fd);
        let epoller = Arc::clone(&self.epoller);
        let reaped = Arc::clone(&self.reaped);
        let conn_events = self.conn_events;
        self.pool
            .submit(move || on_write(&conn, &epoller, conn_events, &reaped));
    }

    fn extend_time(&mut self, fd: RawFd) {
        if self.timeout_ms > 0 {
            self.timer.adjust(fd, self.timeout_ms as u64);
        }
    }

    /// Reactor-side close: HUP/error notifications and registration
    /// failures.
    fn drop_conn(&mut self, fd: RawFd) {
        self.timer.cancel(fd);
        if let Some(conn) = self.conns.remove(&fd) {
            if let Ok(mut c) = conn.lock() {
                if !c.is_closed() {
                    let _ = self.epoller.delete(fd);
                    c.close();
                }
            }
        }
    }

    /// Removes table entries for descriptors a worker or the timer already
    /// closed. The descriptor may since have been reused by a newer accept,
    /// so only a connection that is actually closed is dropped.
    fn reap_closed(&mut self) {
        let fds: Vec<RawFd> = match self.reaped.lock() {
            Ok(mut reaped) => reaped.drain(..).collect(),
            Err(_) => return,
        };
        for fd in fds {
            let closed = self
                .conns
                .get(&fd)
                .is_some_and(|conn| conn.lock().map(|c| c.is_closed()).unwrap_or(true));
            if closed {
                self.timer.cancel(fd);
                self.conns.remove(&fd);
            }
        }
    }
}

/// Timer expiry: runs on the reactor thread, closes the idle connection,
/// and queues the descriptor for table cleanup.
fn expire_conn(fd: RawFd, conn: &Mutex<HttpConn>, epoller: &Epoller, reaped: &Mutex<Vec<RawFd>>) {
    if let Ok(mut c) = conn.lock() {
        if !c.is_closed() {
            info!("Client[{fd}] timed out");
            let _ = epoller.delete(fd);
            c.close();
        }
    }
    if let Ok(mut reaped) = reaped.lock() {
        reaped.push(fd);
    }
}

fn on_read(
    conn: &Mutex<HttpConn>,
    epoller: &Epoller,
    conn_events: u32,
    reaped: &Mutex<Vec<RawFd>>,
) {
    let Ok(mut c) = conn.lock() else {
        return;
    };
    match c.read() {
        Ok(0) => {
            close_now(&mut c, epoller, reaped);
            return;
        }
        Err(e) if e.kind() != ErrorKind::WouldBlock => {
            warn!("read failed on fd {}: {e}", c.fd());
            close_now(&mut c, epoller, reaped);
            return;
        }
        _ => {}
    }
    on_process(&mut c, epoller, conn_events, reaped);
}

fn on_write(
    conn: &Mutex<HttpConn>,
    epoller: &Epoller,
    conn_events: u32,
    reaped: &Mutex<Vec<RawFd>>,
) {
    let Ok(mut c) = conn.lock() else {
        return;
    };
    let result = c.write();
    if c.to_write_bytes() == 0 {
        // Response fully drained: either start over or say goodbye.
        if c.is_keep_alive() {
            on_process(&mut c, epoller, conn_events, reaped);
        } else {
            close_now(&mut c, epoller, reaped);
        }
        return;
    }
    match result {
        Err(e) if e.kind() != ErrorKind::WouldBlock => {
            warn!("write failed on fd {}: {e}", c.fd());
            close_now(&mut c, epoller, reaped);
        }
        _ => {
            // Partial drain: wait for the socket to accept more.
            if let Err(e) = epoller.modify(c.fd(), EPOLLOUT | conn_events) {
                warn!("failed to re-arm fd {} for writing: {e}", c.fd());
                close_now(&mut c, epoller, reaped);
            }
        }
    }
}

/// Every normal task exit must re-arm the descriptor; a connection that is
/// neither re-armed nor closed stalls until its timer fires.
fn on_process(c: &mut HttpConn, epoller: &Epoller, conn_events: u32, reaped: &Mutex<Vec<RawFd>>) {
    let interest = if c.process() { EPOLLOUT } else { EPOLLIN };
    if let Err(e) = epoller.modify(c.fd(), interest | conn_events) {
        warn!("failed to re-arm fd {}: {e}", c.fd());
        close_now(c, epoller, reaped);
    }
}

/// Worker-side close; the reactor learns about it through the reaped list.
fn close_now(c: &mut HttpConn, epoller: &Epoller, reaped: &Mutex<Vec<RawFd>>) {
    let fd = c.fd();
    if !c.is_closed() {
        let _ = epoller.delete(fd);
        c.close();
    }
    if let Ok(mut reaped) = reaped.lock() {
        reaped.push(fd);
    }
}

fn send_error(fd: RawFd, msg: &[u8]) {
    if syscall!(send(fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0)).is_err() {
        warn!("failed to send error to client fd {fd}");
    }
    let _ = syscall!(close(fd));
}

fn init_socket(config: &Config) -> io::Result<OwnedFd> {
    let fd = syscall!(socket(libc::AF_INET, libc::SOCK_STREAM, 0))?;
    // Safety: fresh descriptor from socket(2).
    let listen_fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let linger = libc::linger {
        l_onoff: libc::c_int::from(config.open_linger),
        l_linger: libc::c_int::from(config.open_linger),
    };
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_LINGER,
        &linger as *const libc::linger as *const libc::c_void,
        mem::size_of::<libc::linger>() as libc::socklen_t
    ))?;

    let reuse: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &reuse as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t
    ))?;

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: config.port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: libc::INADDR_ANY.to_be(),
        },
        sin_zero: [0; 8],
    };
    syscall!(bind(
        fd,
        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
    ))?;
    syscall!(listen(fd, LISTEN_BACKLOG))?;
    set_nonblocking(fd)?;
    Ok(listen_fd)
}

fn local_port(fd: RawFd) -> io::Result<u16> {
    // Safety: zeroed sockaddr_in is a valid out-parameter pattern.
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
        &mut len
    ))?;
    Ok(u16::from_be(addr.sin_port))
}

fn peer_addr(addr: &libc::sockaddr_in) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    ))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL, 0))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map(|_| ())
}
