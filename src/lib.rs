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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! hurtig is a small epoll-driven HTTP/1.1 server for static files, with a
//! login/register endpoint backed by a relational credential store.
//!
//! A single reactor thread owns the readiness loop, a heap timer for idle
//! connections, and the table of live connections; request parsing and
//! response assembly run on a bounded worker pool. Files are served through
//! `mmap(2)` and drained with a single scatter-write per readiness
//! notification.

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod buffer;
pub mod config;
pub mod connection;
pub mod epoll;
pub mod http;
pub mod logger;
pub mod server;
pub mod sql;
pub mod timer;
pub mod worker;

pub use config::Config;
pub use server::Server;
