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

//! Per-connection byte buffer with independent read and write cursors.

use std::io::{self, Write};
use std::os::fd::RawFd;

/// Size of the stack-side spill region used by [`Buffer::read_fd`]. One
/// readiness notification must be able to drain everything the kernel
/// currently holds, even when the buffer itself is small.
const SPILL_SIZE: usize = 64 * 1024;

/// A growable, contiguous byte buffer.
///
/// The readable span is `[read_pos, write_pos)`, the writable span is
/// `[write_pos, capacity)`. Cursors only move forward; the space in front of
/// `read_pos` is reclaimed by compaction before the buffer reallocates.
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Creates a buffer with `init_size` bytes of capacity.
    pub fn new(init_size: usize) -> Self {
        Self {
            buf: vec![0; init_size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes available to write without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Number of already-consumed bytes in front of the read cursor.
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// The readable span.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Consumes `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.read_pos += len;
    }

    /// Consumes readable bytes up to offset `end` of the readable span.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Resets both cursors, discarding all readable bytes.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Returns the readable span as a `String` and resets the buffer.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Guarantees at least `len` writable bytes, compacting the buffer when
    /// the dead prepend space suffices and growing it otherwise.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Marks `len` bytes as written, advancing the write cursor.
    pub fn has_written(&mut self, len: usize) {
        self.write_pos += len;
    }

    /// Copies `data` into the writable span, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Scatter-reads from `fd` into the writable span plus a stack spill
    /// region, so a single notification drains all currently available
    /// bytes. Spilled bytes are appended afterwards.
    ///
    /// `Ok(0)` means the peer closed its end.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut spill = [0u8; SPILL_SIZE];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                // Safety: `write_pos <= buf.len()`, so the pointer stays
                // within the allocation; `iov_len` bounds the kernel write.
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.write_pos) }
                    as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: spill.as_mut_ptr() as *mut libc::c_void,
                iov_len: spill.len(),
            },
        ];

        let n = syscall!(readv(fd, iov.as_ptr(), 2))? as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&spill[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable span to `fd`, advancing the read cursor by the
    /// number of bytes accepted by the kernel.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = syscall!(write(
            fd,
            // Safety: `read_pos <= buf.len()`; `readable` bounds the read.
            unsafe { self.buf.as_ptr().add(self.read_pos) } as *const libc::c_void,
            readable,
        ))? as usize;
        self.read_pos += n;
        Ok(n)
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write as _;
    use std::os::fd::{AsRawFd, FromRawFd};

    use super::Buffer;

    #[test]
    fn cursors_stay_ordered() {
        let mut buf = Buffer::new(8);
        buf.append(b"hello");
        assert_eq!(5, buf.readable_bytes());
        assert_eq!(b"hello", buf.peek());
        buf.retrieve(2);
        assert_eq!(3, buf.readable_bytes());
        assert_eq!(2, buf.prependable_bytes());
        assert_eq!(b"llo", buf.peek());
    }

    #[test]
    fn retrieve_all_to_string_round_trips() {
        let mut buf = Buffer::new(16);
        buf.append(b"GET / HTTP/1.1");
        let len = buf.readable_bytes();
        let s = buf.retrieve_all_to_string();
        assert_eq!(len, s.len());
        assert_eq!("GET / HTTP/1.1", s);
        assert_eq!(0, buf.readable_bytes());
        assert_eq!(0, buf.prependable_bytes());
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = Buffer::new(8);
        buf.append(b"abcdefgh");
        buf.retrieve(6);
        // 2 readable, 6 prependable; 4 fits without reallocating.
        buf.append(b"1234");
        assert_eq!(b"gh1234", buf.peek());
        assert_eq!(0, buf.prependable_bytes());
    }

    #[test]
    fn grows_when_compaction_is_not_enough() {
        let mut buf = Buffer::new(4);
        buf.append(b"abcd");
        buf.append(b"efghijkl");
        assert_eq!(b"abcdefghijkl", buf.peek());
    }

    #[test]
    fn retrieve_until_consumes_prefix() {
        let mut buf = Buffer::new(16);
        buf.append(b"line\r\nrest");
        buf.retrieve_until(6);
        assert_eq!(b"rest", buf.peek());
    }

    #[test]
    fn read_fd_spills_into_append() {
        let mut fds = [0; 2];
        assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
        let mut wr = unsafe { File::from_raw_fd(fds[1]) };
        let rd = unsafe { File::from_raw_fd(fds[0]) };

        let payload = vec![b'x'; 4096];
        wr.write_all(&payload).unwrap();
        drop(wr);

        // Buffer is far smaller than the payload; the spill path covers it.
        let mut buf = Buffer::new(16);
        let n = buf.read_fd(rd.as_raw_fd()).unwrap();
        assert_eq!(payload.len(), n);
        assert_eq!(payload, buf.peek());
    }

    #[test]
    fn write_fd_drains_readable_span() {
        let mut fds = [0; 2];
        assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
        let mut rd = unsafe { File::from_raw_fd(fds[0]) };
        let wr = unsafe { File::from_raw_fd(fds[1]) };

        let mut buf = Buffer::new(16);
        buf.append(b"response bytes");
        let n = buf.write_fd(wr.as_raw_fd()).unwrap();
        assert_eq!(14, n);
        assert_eq!(0, buf.readable_bytes());
        drop(wr);

        let mut got = String::new();
        use std::io::Read as _;
        rd.read_to_string(&mut got).unwrap();
        assert_eq!("response bytes", got);
    }
}
