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

//! CLI entry point: parse flags, bring up the log sink and credential
//! store, and run the reactor until it stops.

use std::sync::Arc;

use clap::Parser;
use log::info;

use hurtig::config::{event_masks, Config, LogConfig, SqlConfig};
use hurtig::epoll::EPOLLET;
use hurtig::logger;
use hurtig::server::Server;
use hurtig::sql::SqlConnPool;

/// Small epoll-driven HTTP/1.1 static file server.
#[derive(Parser, Debug)]
#[command(name = "hurtig", version, about)]
struct Cli {
    /// Listen port.
    #[arg(long, default_value_t = 1316, value_parser = clap::value_parser!(u16).range(1024..))]
    port: u16,

    /// Readiness trigger mode: 0 LT/LT, 1 LT/ET, 2 ET/LT, 3 ET/ET.
    #[arg(long, default_value_t = 3)]
    trigger_mode: u8,

    /// Idle-connection timeout in milliseconds; 0 disables the timer.
    #[arg(long, default_value_t = 60_000)]
    timeout_ms: i64,

    /// Enable SO_LINGER on the listen socket.
    #[arg(long)]
    open_linger: bool,

    /// Root directory of the static resource tree.
    #[arg(long, default_value = "./resources")]
    src_dir: String,

    /// MySQL host.
    #[arg(long, default_value = "localhost")]
    sql_host: String,

    /// MySQL port.
    #[arg(long, default_value_t = 3306)]
    sql_port: u16,

    /// MySQL user.
    #[arg(long, default_value = "root")]
    sql_user: String,

    /// MySQL password.
    #[arg(long, default_value = "root")]
    sql_password: String,

    /// Database holding the `user` table.
    #[arg(long, default_value = "webserver")]
    sql_db: String,

    /// Number of pooled MySQL connections.
    #[arg(long, default_value_t = 12)]
    sql_pool_size: usize,

    /// Number of worker threads.
    #[arg(long, default_value_t = 8)]
    worker_count: usize,

    /// Whether to write a log at all.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    open_log: bool,

    /// Log level: 0 debug, 1 info, 2 warn, 3 error.
    #[arg(long, default_value_t = 1)]
    log_level: usize,

    /// Directory receiving per-day log files.
    #[arg(long, default_value = "./log")]
    log_dir: String,

    /// Lines buffered for the log writer thread; 0 writes synchronously.
    #[arg(long, default_value_t = 1024)]
    log_queue_size: usize,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            port: self.port,
            trigger_mode: self.trigger_mode,
            timeout_ms: self.timeout_ms,
            open_linger: self.open_linger,
            worker_count: self.worker_count,
            src_dir: self.src_dir,
            sql: SqlConfig {
                host: self.sql_host,
                port: self.sql_port,
                user: self.sql_user,
                password: self.sql_password,
                database: self.sql_db,
                pool_size: self.sql_pool_size,
            },
            log: LogConfig {
                open: self.open_log,
                level: self.log_level,
                dir: self.log_dir,
                queue_size: self.log_queue_size,
            },
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config();

    if config.log.open {
        logger::init(config.log.level, &config.log.dir, config.log.queue_size)?;
    }

    let store = Arc::new(SqlConnPool::connect(&config.sql));

    info!("========== Server init ==========");
    info!(
        "Port: {}, OpenLinger: {}",
        config.port, config.open_linger
    );
    let (listen_events, conn_events) = event_masks(config.trigger_mode);
    info!(
        "Listen Mode: {}, OpenConn Mode: {}",
        if listen_events & EPOLLET != 0 { "ET" } else { "LT" },
        if conn_events & EPOLLET != 0 { "ET" } else { "LT" },
    );
    info!("LogSys level: {}", config.log.level);
    info!("srcDir: {}", config.src_dir);
    info!(
        "SqlConnPool num: {}, WorkerPool num: {}",
        store.size(),
        config.worker_count
    );

    let mut server = Server::new(&config, store)?;
    server.run();

    // The sink may still hold buffered lines; get them to disk before exit.
    log::logger().flush();
    Ok(())
}
