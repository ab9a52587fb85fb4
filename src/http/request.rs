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

//! Incremental HTTP/1.1 request parser.

use std::collections::HashMap;

use super::{auth_route, is_default_page, Method};
use crate::buffer::Buffer;
use crate::sql::CredentialStore;

/// Position of the parser in the request grammar. The state only ever
/// advances; a finished request must be reset before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    /// Waiting for the request line.
    #[default]
    RequestLine,
    /// Consuming header lines until the empty line.
    Headers,
    /// Consuming the body of a POST.
    Body,
    /// A complete request has been read.
    Finish,
}

/// Outcome of a [`HttpRequest::parse`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The buffer holds no complete unit of input; re-arm for reading.
    NeedsMore,
    /// A full request was parsed and a response can be generated.
    Finished,
    /// The request line is malformed; answer 400 and close.
    BadRequest,
}

/// A parsed (or in-progress) request.
#[derive(Debug, Default)]
pub struct HttpRequest {
    state: ParseState,
    method: Option<Method>,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    form: HashMap<String, String>,
}

impl HttpRequest {
    /// Creates an empty request in the initial state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the parser to its initial state, dropping all fields.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Consumes as much of `buf` as the grammar allows, advancing the state
    /// machine. Failures are reported through the status, never by
    /// panicking; after [`ParseStatus::BadRequest`] the parser must not be
    /// fed again.
    pub fn parse(&mut self, buf: &mut Buffer, store: &dyn CredentialStore) -> ParseStatus {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(line) = take_line(buf) else {
                        return ParseStatus::NeedsMore;
                    };
                    if !self.parse_request_line(&line) {
                        return ParseStatus::BadRequest;
                    }
                    self.canonicalize_path();
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line) = take_line(buf) else {
                        return ParseStatus::NeedsMore;
                    };
                    if line.is_empty() {
                        self.state = if self.method == Some(Method::Post) {
                            ParseState::Body
                        } else {
                            ParseState::Finish
                        };
                    } else {
                        self.parse_header(&line);
                    }
                }
                ParseState::Body => {
                    match self.content_length() {
                        Some(len) => {
                            if buf.readable_bytes() < len {
                                return ParseStatus::NeedsMore;
                            }
                            self.body = String::from_utf8_lossy(&buf.peek()[..len]).into_owned();
                            buf.retrieve(len);
                        }
                        None => {
                            self.body = buf.retrieve_all_to_string();
                        }
                    }
                    self.parse_post(store);
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => return ParseStatus::Finished,
            }
        }
    }

    /// The request method, once the request line has been read.
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// The (canonicalized, possibly auth-rewritten) request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The HTTP version token, e.g. `1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Case-insensitive header lookup; the stored names keep their wire
    /// spelling.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value of a decoded form field of the POST body.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// Whether a full request has been parsed.
    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    /// The connection may be reused iff the client speaks 1.1 and asked for
    /// it.
    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
    }

    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split(' ');
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let Some(method) = Method::from_token(method) else {
            return false;
        };
        let Some(version) = version.strip_prefix("HTTP/") else {
            return false;
        };
        if path.is_empty() || version.is_empty() {
            return false;
        }

        self.method = Some(method);
        self.path = path.to_string();
        self.version = version.to_string();
        true
    }

    fn canonicalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if is_default_page(&self.path) {
            self.path.push_str(".html");
        }
    }

    fn parse_header(&mut self, line: &str) {
        // A line without a colon is skipped, not treated as fatal.
        if let Some((name, value)) = line.split_once(':') {
            self.headers
                .insert(name.to_string(), value.trim_start().to_string());
        }
    }

    fn content_length(&self) -> Option<usize> {
        self.header("Content-Length")?.parse().ok()
    }

    fn parse_post(&mut self, store: &dyn CredentialStore) {
        if self.method != Some(Method::Post) {
            return;
        }
        let urlencoded = self
            .header("Content-Type")
            .is_some_and(|v| v == "application/x-www-form-urlencoded");
        if !urlencoded {
            return;
        }

        self.form = decode_urlencoded(&self.body);
        if let Some(is_register) = auth_route(&self.path) {
            let username = self.form_value("username").unwrap_or("").to_string();
            let password = self.form_value("password").unwrap_or("").to_string();
            self.path = if store.verify(&username, &password, is_register) {
                "/welcome.html".to_string()
            } else {
                "/error.html".to_string()
            };
        }
    }
}

/// Takes one CRLF-terminated line off the readable span, without the
/// terminator. `None` when no full line is buffered yet.
fn take_line(buf: &mut Buffer) -> Option<String> {
    let readable = buf.peek();
    let pos = readable.windows(2).position(|w| w == b"\r\n")?;
    let line = String::from_utf8_lossy(&readable[..pos]).into_owned();
    buf.retrieve_until(pos + 2);
    Some(line)
}

fn decode_urlencoded(body: &str) -> HashMap<String, String> {
    let mut form = HashMap::new();
    for pair in body.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            form.insert(decode_component(key), decode_component(value));
        }
    }
    form
}

fn decode_component(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2]))
            {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use fake::Fake;

    use super::{decode_component, decode_urlencoded, HttpRequest, ParseStatus};
    use crate::buffer::Buffer;
    use crate::http::Method;
    use crate::sql::CredentialStore;
    use crate::sql::MemoryStore;

    fn buffer(bytes: &[u8]) -> Buffer {
        let mut buf = Buffer::new(1024);
        buf.append(bytes);
        buf
    }

    #[test]
    fn parses_a_get_request() {
        let store = MemoryStore::default();
        let mut buf = buffer(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n");
        let mut req = HttpRequest::new();

        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert_eq!(Some(Method::Get), req.method());
        assert_eq!("/index.html", req.path());
        assert_eq!("1.1", req.version());
        assert_eq!(Some("localhost"), req.header("host"));
        assert!(req.is_keep_alive());
    }

    #[test]
    fn appends_html_to_default_pages() {
        let store = MemoryStore::default();
        let mut buf = buffer(b"GET /picture HTTP/1.1\r\n\r\n");
        let mut req = HttpRequest::new();
        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert_eq!("/picture.html", req.path());
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn resumes_across_packet_boundaries() {
        let store = MemoryStore::default();
        let mut buf = buffer(b"GET /index.html HT");
        let mut req = HttpRequest::new();
        assert_eq!(ParseStatus::NeedsMore, req.parse(&mut buf, &store));

        buf.append(b"TP/1.1\r\nConnection: ");
        assert_eq!(ParseStatus::NeedsMore, req.parse(&mut buf, &store));

        buf.append(b"close\r\n\r\n");
        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert_eq!("/index.html", req.path());
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn rejects_malformed_request_line() {
        let store = MemoryStore::default();
        for raw in [
            &b"BREW / HTTP/1.1\r\n\r\n"[..],
            &b"GET /index.html\r\n\r\n"[..],
            &b"GET / nonsense/1.1\r\n\r\n"[..],
            &b"GET / HTTP/1.1 extra\r\n\r\n"[..],
        ] {
            let mut req = HttpRequest::new();
            let mut buf = buffer(raw);
            assert_eq!(
                ParseStatus::BadRequest,
                req.parse(&mut buf, &store),
                "accepted {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn skips_malformed_header_lines() {
        let store = MemoryStore::default();
        let mut buf =
            buffer(b"GET / HTTP/1.1\r\nthis line has no colon\r\nHost: here\r\n\r\n");
        let mut req = HttpRequest::new();
        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert_eq!(Some("here"), req.header("Host"));
    }

    #[test]
    fn keep_alive_requires_version_and_header() {
        let store = MemoryStore::default();
        let mut req = HttpRequest::new();
        let mut buf = buffer(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert!(!req.is_keep_alive());

        let mut req = HttpRequest::new();
        let mut buf = buffer(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn login_rewrites_path_on_success() {
        let store = MemoryStore::with_user("alice", "s3cret");
        let body = b"username=alice&password=s3cret";
        let head = format!(
            "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\r\n",
            body.len()
        );
        let mut buf = buffer(head.as_bytes());
        buf.append(body);

        let mut req = HttpRequest::new();
        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert_eq!("/welcome.html", req.path());
        assert_eq!(Some("alice"), req.form_value("username"));
    }

    #[test]
    fn login_rewrites_path_on_failure() {
        let store = MemoryStore::with_user("alice", "s3cret");
        let body = b"username=alice&password=wrong";
        let head = format!(
            "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\r\n",
            body.len()
        );
        let mut buf = buffer(head.as_bytes());
        buf.append(body);

        let mut req = HttpRequest::new();
        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert_eq!("/error.html", req.path());
    }

    #[test]
    fn register_creates_account() {
        let store = MemoryStore::default();
        let body = b"username=bob&password=hunter2";
        let head = format!(
            "POST /register HTTP/1.1\r\nContent-Length: {}\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\r\n",
            body.len()
        );
        let mut buf = buffer(head.as_bytes());
        buf.append(body);

        let mut req = HttpRequest::new();
        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert_eq!("/welcome.html", req.path());
        assert!(store.verify("bob", "hunter2", false));
    }

    #[test]
    fn empty_login_body_fails_auth() {
        // A zero-length POST finishes parsing with an empty form; the
        // credential check fails and the error page is served.
        let store = MemoryStore::with_user("alice", "s3cret");
        let mut buf = buffer(
            b"POST /login HTTP/1.1\r\nContent-Length: 0\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\r\n",
        );
        let mut req = HttpRequest::new();
        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert_eq!("/error.html", req.path());
    }

    #[test]
    fn waits_for_the_full_body() {
        let store = MemoryStore::with_user("alice", "s3cret");
        let mut buf = buffer(
            b"POST /login HTTP/1.1\r\nContent-Length: 30\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\r\nusername=al",
        );
        let mut req = HttpRequest::new();
        assert_eq!(ParseStatus::NeedsMore, req.parse(&mut buf, &store));

        buf.append(b"ice&password=s3cret");
        assert_eq!(ParseStatus::Finished, req.parse(&mut buf, &store));
        assert_eq!("/welcome.html", req.path());
    }

    #[test]
    fn decodes_percent_escapes_and_plus() {
        assert_eq!("a b", decode_component("a+b"));
        assert_eq!("50%", decode_component("50%25"));
        assert_eq!("x=y", decode_component("x%3Dy"));
        // Truncated escape survives literally.
        assert_eq!("%2", decode_component("%2"));

        let form = decode_urlencoded("username=a+b&password=p%40ss");
        assert_eq!(Some("a b"), form.get("username").map(String::as_str));
        assert_eq!(Some("p@ss"), form.get("password").map(String::as_str));
    }

    #[test]
    fn form_round_trips_generated_pairs() {
        fn encode(s: &str) -> String {
            s.chars()
                .map(|c| if c == ' ' { '+' } else { c })
                .collect()
        }

        for _ in 0..32 {
            let key: String = (4..12).fake();
            let value = format!("{} {}", (4..12).fake::<String>(), (4..12).fake::<String>());
            let body = format!("{}={}", encode(&key), encode(&value));
            let form = decode_urlencoded(&body);
            assert_eq!(Some(value.as_str()), form.get(&key).map(String::as_str));
        }
    }
}
