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

//! Response assembly: status line, headers, and a memory-mapped file body.

use std::fmt;
use std::fs::{self, File};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::ptr::NonNull;

use super::{error_page, mime_type, reason_phrase};
use crate::buffer::Buffer;

/// Read-only private mapping of a served file. Unmapped exactly once, on
/// drop.
struct MmapFile {
    ptr: NonNull<u8>,
    len: usize,
}

impl MmapFile {
    fn map(file: &File) -> Option<Self> {
        let len = file.metadata().ok()?.len() as usize;
        if len == 0 {
            return None;
        }
        // Safety: mapping a whole, open file read-only; failure is checked
        // against MAP_FAILED below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr as *mut u8).map(|ptr| Self { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        // Safety: the mapping is valid for `len` bytes until munmap in drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapFile {
    fn drop(&mut self) {
        // Safety: `ptr`/`len` came from a successful mmap and are unmapped
        // only here.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

// Safety: the mapping is read-only and exclusively owned; moving it across
// threads with its connection is sound.
unsafe impl Send for MmapFile {}

impl fmt::Debug for MmapFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapFile").field("len", &self.len).finish()
    }
}

/// Builds one response for the request path it was initialized with.
#[derive(Debug, Default)]
pub struct HttpResponse {
    code: Option<u16>,
    keep_alive: bool,
    path: String,
    src_dir: String,
    mm_file: Option<MmapFile>,
}

impl HttpResponse {
    /// Creates an empty responder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares the responder for a new exchange, releasing any previous
    /// mapping. `code` is `None` until an earlier stage already decided the
    /// status (e.g. a 400 from the parser).
    pub fn init(&mut self, src_dir: &str, path: &str, keep_alive: bool, code: Option<u16>) {
        self.mm_file = None;
        self.code = code;
        self.keep_alive = keep_alive;
        self.path = path.to_string();
        self.src_dir = src_dir.to_string();
    }

    /// Writes status line and headers into `buf` and maps the served file.
    /// Error statuses are redirected to their error page; when even that
    /// cannot be opened or mapped, an inline HTML body is appended to `buf`
    /// instead.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        // A status decided upstream (the parser's 400) is final; otherwise
        // the target file classifies the request.
        if self.code.is_none() {
            self.code = match fs::metadata(self.full_path()) {
                Err(_) => Some(404),
                Ok(md) if md.is_dir() => Some(404),
                Ok(md) if md.permissions().mode() & 0o004 == 0 => Some(403),
                Ok(_) => Some(200),
            };
        }
        if let Some(page) = self.code.and_then(error_page) {
            self.path = page.to_string();
        }

        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    /// The decided status code.
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    /// The mapped file body, when one was set up.
    pub fn file(&self) -> Option<&[u8]> {
        self.mm_file.as_ref().map(MmapFile::as_slice)
    }

    /// Releases the file mapping, if any.
    pub fn unmap(&mut self) {
        self.mm_file = None;
    }

    fn full_path(&self) -> String {
        format!("{}{}", self.src_dir, self.path)
    }

    fn add_status_line(&mut self, buf: &mut Buffer) {
        let reason = match self.code.and_then(reason_phrase) {
            Some(reason) => reason,
            None => {
                self.code = Some(400);
                "Bad Request"
            }
        };
        let code = self.code.unwrap_or(400);
        buf.append(format!("HTTP/1.1 {code} {reason}\r\n").as_bytes());
    }

    fn add_headers(&self, buf: &mut Buffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", mime_type(&self.path)).as_bytes());
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let file = match File::open(self.full_path()) {
            Ok(file) => file,
            Err(_) => {
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        match MmapFile::map(&file) {
            Some(map) => {
                buf.append(format!("Content-length: {}\r\n\r\n", map.len).as_bytes());
                self.mm_file = Some(map);
            }
            None => self.error_content(buf, "File NotFound!"),
        }
    }

    /// Appends an inline HTML error body, used when no error page can be
    /// served from disk.
    pub fn error_content(&self, buf: &mut Buffer, message: &str) {
        let code = self.code.unwrap_or(400);
        let status = reason_phrase(code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{code} : {status}\n\
             <p>{message}</p><hr><em>hurtig</em></body></html>"
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::HttpResponse;
    use crate::buffer::Buffer;

    fn resources() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "HELLO").unwrap();
        fs::write(dir.path().join("404.html"), "<html>gone</html>").unwrap();
        fs::write(dir.path().join("403.html"), "<html>nope</html>").unwrap();
        dir
    }

    fn respond(dir: &tempfile::TempDir, path: &str, keep_alive: bool) -> (HttpResponse, String) {
        let mut response = HttpResponse::new();
        response.init(dir.path().to_str().unwrap(), path, keep_alive, None);
        let mut buf = Buffer::new(1024);
        response.make_response(&mut buf);
        let head = buf.retrieve_all_to_string();
        (response, head)
    }

    #[test]
    fn serves_existing_file_with_keep_alive_envelope() {
        let dir = resources();
        let (response, head) = respond(&dir, "/index.html", true);

        assert_eq!(Some(200), response.code());
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.ends_with("Content-length: 5\r\n\r\n"));
        assert_eq!(Some(&b"HELLO"[..]), response.file());

        // Envelope order is fixed.
        let conn = head.find("Connection:").unwrap();
        let ctype = head.find("Content-type:").unwrap();
        let clen = head.find("Content-length:").unwrap();
        assert!(conn < ctype && ctype < clen);
    }

    #[test]
    fn missing_file_serves_error_page() {
        let dir = resources();
        let (response, head) = respond(&dir, "/nope.html", false);

        assert_eq!(Some(404), response.code());
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(Some(&b"<html>gone</html>"[..]), response.file());
    }

    #[test]
    fn directory_target_is_not_found() {
        let dir = resources();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        let (response, _) = respond(&dir, "/subdir", false);
        assert_eq!(Some(404), response.code());
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let dir = resources();
        let secret = dir.path().join("secret.html");
        fs::write(&secret, "hidden").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o200)).unwrap();

        let (response, head) = respond(&dir, "/secret.html", false);
        assert_eq!(Some(403), response.code());
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert_eq!(Some(&b"<html>nope</html>"[..]), response.file());
    }

    #[test]
    fn falls_back_to_inline_body_without_error_page() {
        let dir = tempfile::tempdir().unwrap();
        let (response, head) = respond(&dir, "/nope.html", false);

        assert_eq!(Some(404), response.code());
        assert!(response.file().is_none());
        assert!(head.contains("404 : Not Found"));
        assert!(head.contains("<p>File NotFound!</p>"));

        let body_len = head.split("\r\n\r\n").nth(1).unwrap().len();
        assert!(head.contains(&format!("Content-length: {body_len}\r\n")));
    }

    #[test]
    fn reinit_releases_previous_mapping() {
        let dir = resources();
        let (mut response, _) = respond(&dir, "/index.html", true);
        assert!(response.file().is_some());

        response.init(dir.path().to_str().unwrap(), "/404.html", false, None);
        assert!(response.file().is_none());
    }
}
