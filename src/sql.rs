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

//! Credential store backing the login and register routes.

use std::fmt;
use std::sync::Mutex;

use log::{error, warn};
use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder};
use std_semaphore::Semaphore;

use crate::config::SqlConfig;

/// Synchronous credential check used by the request parser.
///
/// A store never surfaces its failures to the caller; an unreachable
/// backend behaves like a failed check.
pub trait CredentialStore: Send + Sync {
    /// Checks `username`/`password`, creating the account first when
    /// `is_register` is set. Returns whether the pair is now valid.
    fn verify(&self, username: &str, password: &str, is_register: bool) -> bool;
}

/// Fixed-size pool of MySQL connections gated by a counting semaphore.
///
/// `verify` blocks until a connection is free and returns it on every exit
/// path.
pub struct SqlConnPool {
    conns: Mutex<Vec<Conn>>,
    slots: Semaphore,
    size: usize,
}

impl SqlConnPool {
    /// Opens `cfg.pool_size` connections. Individual failures shrink the
    /// pool rather than aborting; an empty pool fails every check.
    pub fn connect(cfg: &SqlConfig) -> Self {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(cfg.host.as_str()))
            .tcp_port(cfg.port)
            .user(Some(cfg.user.as_str()))
            .pass(Some(cfg.password.as_str()))
            .db_name(Some(cfg.database.as_str()));

        let mut conns = Vec::with_capacity(cfg.pool_size);
        for _ in 0..cfg.pool_size {
            match Conn::new(opts.clone()) {
                Ok(conn) => conns.push(conn),
                Err(e) => error!("MySql connect error: {e}"),
            }
        }
        if conns.is_empty() {
            warn!(
                "credential store has no connections; every auth check will fail"
            );
        }

        let size = conns.len();
        Self {
            slots: Semaphore::new(size as isize),
            conns: Mutex::new(conns),
            size,
        }
    }

    /// Number of connections the pool holds.
    pub fn size(&self) -> usize {
        self.size
    }

    fn get_conn(&self) -> Option<Conn> {
        if self.size == 0 {
            return None;
        }
        self.slots.acquire();
        match self.conns.lock() {
            Ok(mut conns) => conns.pop(),
            Err(_) => {
                self.slots.release();
                None
            }
        }
    }

    fn put_conn(&self, conn: Conn) {
        if let Ok(mut conns) = self.conns.lock() {
            conns.push(conn);
            self.slots.release();
        }
    }
}

impl CredentialStore for SqlConnPool {
    fn verify(&self, username: &str, password: &str, is_register: bool) -> bool {
        let Some(mut conn) = self.get_conn() else {
            warn!("credential store unavailable, rejecting {username:?}");
            return false;
        };
        let ok = match run_verify(&mut conn, username, password, is_register) {
            Ok(ok) => ok,
            Err(e) => {
                warn!("credential check failed for {username:?}: {e}");
                false
            }
        };
        self.put_conn(conn);
        ok
    }
}

fn run_verify(
    conn: &mut Conn,
    username: &str,
    password: &str,
    is_register: bool,
) -> mysql::Result<bool> {
    let stored: Option<String> = conn.exec_first(
        "SELECT password FROM user WHERE username = ? LIMIT 1",
        (username,),
    )?;

    Ok(match (stored, is_register) {
        // Username is taken.
        (Some(_), true) => false,
        (None, true) => {
            conn.exec_drop(
                "INSERT INTO user(username, password) VALUES (?, ?)",
                (username, password),
            )?;
            true
        }
        (Some(stored), false) => stored == password,
        (None, false) => false,
    })
}

impl fmt::Debug for SqlConnPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlConnPool")
            .field("size", &self.size)
            .finish()
    }
}

/// In-memory store for tests; same observable contract as [`SqlConnPool`].
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    users: Mutex<std::collections::HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryStore {
    pub(crate) fn with_user(username: &str, password: &str) -> Self {
        let store = Self::default();
        store
            .users
            .lock()
            .unwrap()
            .insert(username.to_string(), password.to_string());
        store
    }
}

#[cfg(test)]
impl CredentialStore for MemoryStore {
    fn verify(&self, username: &str, password: &str, is_register: bool) -> bool {
        let mut users = self.users.lock().unwrap();
        match (users.get(username), is_register) {
            (Some(_), true) => false,
            (None, true) => {
                users.insert(username.to_string(), password.to_string());
                true
            }
            (Some(stored), false) => stored == password,
            (None, false) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CredentialStore, MemoryStore};

    #[test]
    fn login_checks_stored_password() {
        let store = MemoryStore::with_user("alice", "s3cret");
        assert!(store.verify("alice", "s3cret", false));
        assert!(!store.verify("alice", "wrong", false));
        assert!(!store.verify("bob", "s3cret", false));
    }

    #[test]
    fn register_rejects_taken_username() {
        let store = MemoryStore::with_user("alice", "s3cret");
        assert!(!store.verify("alice", "other", true));
        assert!(store.verify("bob", "hunter2", true));
        assert!(store.verify("bob", "hunter2", false));
    }
}
