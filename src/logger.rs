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

//! Asynchronous file-backed sink behind the `log` facade.
//!
//! Lines go to a per-day file under the configured directory. With a
//! positive queue size, formatting happens on the caller and writing on a
//! dedicated thread fed through a bounded channel; a queue size of zero
//! writes synchronously under a mutex.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crossbeam_channel::{bounded, Sender};
use log::{LevelFilter, Log, Metadata, Record};

enum Message {
    Line(String),
    /// Flush request; the writer acks once everything before it is on disk.
    Flush(Sender<()>),
}

enum Sink {
    Sync(Mutex<LogFile>),
    Async(Sender<Message>),
}

struct Logger {
    sink: Sink,
}

impl Logger {
    fn new(file: LogFile, queue_size: usize) -> io::Result<Self> {
        let sink = if queue_size > 0 {
            let (tx, rx) = bounded::<Message>(queue_size);
            std::thread::Builder::new()
                .name("log-writer".to_string())
                .spawn(move || {
                    let mut file = file;
                    for msg in rx {
                        match msg {
                            Message::Line(line) => file.write_line(&line),
                            Message::Flush(ack) => {
                                file.flush();
                                let _ = ack.send(());
                            }
                        }
                    }
                    file.flush();
                })?;
            Sink::Async(tx)
        } else {
            Sink::Sync(Mutex::new(file))
        };
        Ok(Self { sink })
    }
}

/// Installs the global logger. `level` follows the CLI scale: 0 = debug,
/// 1 = info, 2 = warn, anything else = error.
pub fn init(level: usize, dir: &str, queue_size: usize) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let file = LogFile::open(Path::new(dir))?;

    log::set_boxed_logger(Box::new(Logger::new(file, queue_size)?))
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;
    log::set_max_level(level_filter(level));
    Ok(())
}

fn level_filter(level: usize) -> LevelFilter {
    match level {
        0 => LevelFilter::Debug,
        1 => LevelFilter::Info,
        2 => LevelFilter::Warn,
        _ => LevelFilter::Error,
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record);
        match &self.sink {
            // Backpressure: a full queue blocks the caller rather than
            // dropping the line.
            Sink::Async(tx) => {
                let _ = tx.send(Message::Line(line));
            }
            Sink::Sync(file) => {
                if let Ok(mut file) = file.lock() {
                    file.write_line(&line);
                }
            }
        }
    }

    /// Blocks until every line logged so far is on disk; in async mode the
    /// writer thread acks a sentinel queued behind them.
    fn flush(&self) {
        match &self.sink {
            Sink::Async(tx) => {
                let (ack_tx, ack_rx) = bounded(1);
                if tx.send(Message::Flush(ack_tx)).is_ok() {
                    let _ = ack_rx.recv();
                }
            }
            Sink::Sync(file) => {
                if let Ok(mut file) = file.lock() {
                    file.flush();
                }
            }
        }
    }
}

fn format_line(record: &Record<'_>) -> String {
    let (tm, micros) = now();
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06} [{}] : {}\n",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        micros,
        record.level().as_str().to_ascii_lowercase(),
        record.args()
    )
}

fn now() -> (libc::tm, i64) {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    // Safety: both out-pointers reference valid, writable storage.
    let mut tm = unsafe { std::mem::zeroed::<libc::tm>() };
    unsafe {
        libc::gettimeofday(&mut tv, std::ptr::null_mut());
        libc::localtime_r(&tv.tv_sec, &mut tm);
    }
    (tm, tv.tv_usec as i64)
}

/// One log file per day; rolled over on the first line of a new day.
struct LogFile {
    dir: PathBuf,
    day: (i32, i32, i32),
    file: File,
}

impl LogFile {
    fn open(dir: &Path) -> io::Result<Self> {
        let day = today();
        Ok(Self {
            dir: dir.to_path_buf(),
            file: Self::open_for(dir, day)?,
            day,
        })
    }

    fn open_for(dir: &Path, day: (i32, i32, i32)) -> io::Result<File> {
        let name = format!("{:04}_{:02}_{:02}.log", day.0, day.1, day.2);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))
    }

    fn write_line(&mut self, line: &str) {
        let day = today();
        if day != self.day {
            if let Ok(file) = Self::open_for(&self.dir, day) {
                self.file = file;
                self.day = day;
            }
        }
        let _ = self.file.write_all(line.as_bytes());
    }

    fn flush(&mut self) {
        let _ = self.file.flush();
    }
}

fn today() -> (i32, i32, i32) {
    let (tm, _) = now();
    (tm.tm_year + 1900, tm.tm_mon + 1, tm.tm_mday)
}
