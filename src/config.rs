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

//! Server configuration and readiness trigger modes.

use crate::epoll::{EPOLLET, EPOLLONESHOT, EPOLLRDHUP};

/// Everything the server needs at construction time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port. `0` lets the kernel pick an ephemeral port.
    pub port: u16,
    /// Trigger mode 0–3, see [`event_masks`]. Out-of-range values behave
    /// like 3.
    pub trigger_mode: u8,
    /// Idle-connection timeout in milliseconds; `0` disables the timer.
    pub timeout_ms: i64,
    /// Enable `SO_LINGER` so close blocks briefly for unsent data.
    pub open_linger: bool,
    /// Number of worker threads.
    pub worker_count: usize,
    /// Root directory of the static resource tree.
    pub src_dir: String,
    /// Credential store backend.
    pub sql: SqlConfig,
    /// Log sink settings.
    pub log: LogConfig,
}

/// Connection settings for the MySQL credential store.
#[derive(Debug, Clone)]
pub struct SqlConfig {
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database user.
    pub user: String,
    /// Database password.
    pub password: String,
    /// Database name holding the `user` table.
    pub database: String,
    /// Number of pooled connections.
    pub pool_size: usize,
}

/// Log sink settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether logging is enabled at all.
    pub open: bool,
    /// 0 = debug, 1 = info, 2 = warn, 3 = error.
    pub level: usize,
    /// Directory receiving per-day log files.
    pub dir: String,
    /// Lines buffered for the writer thread; `0` writes synchronously.
    pub queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1316,
            trigger_mode: 3,
            timeout_ms: 60_000,
            open_linger: false,
            worker_count: 8,
            src_dir: "./resources".to_string(),
            sql: SqlConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: "root".to_string(),
            database: "webserver".to_string(),
            pool_size: 12,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            open: true,
            level: 1,
            dir: "./log".to_string(),
            queue_size: 1024,
        }
    }
}

/// Base epoll masks for the listen and connection descriptors under a given
/// trigger mode:
///
/// | mode | listen | conn |
/// |------|--------|------|
/// | 0    | LT     | LT   |
/// | 1    | LT     | ET   |
/// | 2    | ET     | LT   |
/// | 3    | ET     | ET   |
///
/// Connection descriptors are always one-shot so a worker can run without
/// racing the reactor; both sides always watch for peer hangup.
pub fn event_masks(trigger_mode: u8) -> (u32, u32) {
    let mut listen_events = EPOLLRDHUP;
    let mut conn_events = EPOLLONESHOT | EPOLLRDHUP;
    match trigger_mode {
        0 => {}
        1 => conn_events |= EPOLLET,
        2 => listen_events |= EPOLLET,
        _ => {
            listen_events |= EPOLLET;
            conn_events |= EPOLLET;
        }
    }
    (listen_events, conn_events)
}
