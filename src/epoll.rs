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

//! Thin wrapper over the epoll readiness interface.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Readable readiness.
pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
/// Writable readiness.
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
/// Both halves of the socket have closed.
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
/// Peer closed its writing half.
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
/// Error condition on the descriptor.
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
/// Disarm the registration after one notification.
pub const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;
/// Edge-triggered readiness semantics.
pub const EPOLLET: u32 = libc::EPOLLET as u32;

/// Batch of readiness notifications filled by [`Epoller::wait`].
pub struct Events {
    list: Vec<libc::epoll_event>,
}

impl Events {
    /// Creates storage for up to `capacity` notifications per wait.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            list: Vec::with_capacity(capacity),
        }
    }

    /// Number of notifications in the current batch.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether the current batch is empty.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// The descriptor of the i-th notification.
    pub fn fd(&self, i: usize) -> RawFd {
        self.list[i].u64 as RawFd
    }

    /// The event mask of the i-th notification.
    pub fn mask(&self, i: usize) -> u32 {
        self.list[i].events
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("len", &self.list.len())
            .field("capacity", &self.list.capacity())
            .finish()
    }
}

/// Owner of an epoll instance. Registration and modification are safe to
/// call from any thread; only the reactor waits.
#[derive(Debug)]
pub struct Epoller {
    ep: OwnedFd,
}

impl Epoller {
    /// Creates a new epoll instance.
    pub fn new() -> io::Result<Self> {
        // Safety: `epoll_create1(2)` returns a fresh, valid descriptor.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Self { ep })
    }

    /// Registers `fd` with interest in `events`.
    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut ev
        ))
        .map(|_| ())
    }

    /// Replaces the interest set of an already-registered `fd`. This is the
    /// re-arm path for one-shot registrations.
    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut ev
        ))
        .map(|_| ())
    }

    /// Removes `fd` from the interest list.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }

    /// Blocks for up to `timeout_ms` milliseconds (−1 blocks indefinitely)
    /// and fills `events` with ready descriptors, returning the batch size.
    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        events.list.clear();
        let n = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.list.as_mut_ptr(),
            events.list.capacity() as i32,
            timeout_ms,
        ))?;
        // Safety: the kernel initialized exactly `n` entries.
        unsafe { events.list.set_len(n as usize) };
        Ok(n as usize)
    }
}

impl AsRawFd for Epoller {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write as _;
    use std::os::fd::{AsRawFd, FromRawFd};

    use super::{Epoller, Events, EPOLLIN, EPOLLONESHOT, EPOLLOUT};

    fn pipe() -> (File, File) {
        let mut fds = [0; 2];
        assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
        (unsafe { File::from_raw_fd(fds[0]) }, unsafe {
            File::from_raw_fd(fds[1])
        })
    }

    #[test]
    fn reports_readable_pipe_end() {
        let (rd, mut wr) = pipe();
        let ep = Epoller::new().unwrap();
        ep.add(rd.as_raw_fd(), EPOLLIN).unwrap();

        let mut events = Events::with_capacity(8);
        assert_eq!(0, ep.wait(&mut events, 0).unwrap());

        wr.write_all(b"x").unwrap();
        assert_eq!(1, ep.wait(&mut events, 100).unwrap());
        assert_eq!(rd.as_raw_fd(), events.fd(0));
        assert_ne!(0, events.mask(0) & EPOLLIN);
    }

    #[test]
    fn oneshot_disarms_until_rearmed() {
        let (rd, mut wr) = pipe();
        let ep = Epoller::new().unwrap();
        ep.add(rd.as_raw_fd(), EPOLLIN | EPOLLONESHOT).unwrap();
        wr.write_all(b"x").unwrap();

        let mut events = Events::with_capacity(8);
        assert_eq!(1, ep.wait(&mut events, 100).unwrap());
        // Data is still pending, but the registration has been disarmed.
        assert_eq!(0, ep.wait(&mut events, 0).unwrap());

        ep.modify(rd.as_raw_fd(), EPOLLIN | EPOLLONESHOT).unwrap();
        assert_eq!(1, ep.wait(&mut events, 100).unwrap());
    }

    #[test]
    fn delete_stops_notifications() {
        let (_rd, wr) = pipe();
        let ep = Epoller::new().unwrap();
        ep.add(wr.as_raw_fd(), EPOLLOUT).unwrap();

        let mut events = Events::with_capacity(8);
        assert_eq!(1, ep.wait(&mut events, 100).unwrap());

        ep.delete(wr.as_raw_fd()).unwrap();
        assert_eq!(0, ep.wait(&mut events, 0).unwrap());
    }
}
