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

//! HTTP/1.1 request parsing, response assembly, and the fixed routing
//! tables of the server.

use std::fmt::Display;

pub mod request;
pub mod response;

/// Methods accepted on the wire. Anything else is a bad request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Fetch a resource.
    Get,
    /// Submit an urlencoded form to the login/register routes.
    Post,
}

impl Method {
    /// Parses the method token of a request line.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            _ => None,
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// Content type derived from the suffix of `path`. Unknown suffixes and
/// suffix-less paths fall back to `text/plain`.
pub fn mime_type(path: &str) -> &'static str {
    let suffix = match path.rfind('.') {
        Some(i) => &path[i..],
        None => return "text/plain",
    };
    match suffix {
        ".html" => "text/html",
        ".css" => "text/css",
        ".js" => "text/javascript",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".au" => "audio/basic",
        ".mp4" => "video/mp4",
        ".mpg" | ".mpeg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".flv" => "video/flv",
        ".pdf" => "application/pdf",
        ".rtf" => "application/rtf",
        ".word" => "application/nsword",
        ".tar" => "application/x-tar",
        ".gz" => "application/x-gzip",
        _ => "text/plain",
    }
}

/// Reason phrase for the status codes the server emits.
pub fn reason_phrase(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

/// Error page served in place of the requested resource for a failure
/// status.
pub fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

/// Short-name pages that are served as `<name>.html`.
pub fn is_default_page(path: &str) -> bool {
    matches!(
        path,
        "/index" | "/register" | "/login" | "/welcome" | "/video" | "/picture" | "/error"
    )
}

/// Routes whose POST body goes through the credential store. Returns
/// `Some(is_register)`.
pub fn auth_route(path: &str) -> Option<bool> {
    match path {
        "/register.html" => Some(true),
        "/login.html" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{auth_route, error_page, is_default_page, mime_type, reason_phrase, Method};

    #[test]
    fn mime_type_matches_suffix() {
        assert_eq!("text/html", mime_type("/index.html"));
        assert_eq!("image/jpeg", mime_type("/cat.jpeg"));
        assert_eq!("video/mpeg", mime_type("/clip.mpg"));
        assert_eq!("text/plain", mime_type("/archive.unknown"));
        assert_eq!("text/plain", mime_type("/no-suffix"));
    }

    #[test]
    fn unknown_status_has_no_phrase() {
        assert_eq!(Some("OK"), reason_phrase(200));
        assert_eq!(None, reason_phrase(500));
        assert_eq!(None, error_page(200));
    }

    #[test]
    fn default_pages_and_auth_routes() {
        assert!(is_default_page("/login"));
        assert!(is_default_page("/picture"));
        assert!(!is_default_page("/login.html"));
        assert_eq!(Some(false), auth_route("/login.html"));
        assert_eq!(Some(true), auth_route("/register.html"));
        assert_eq!(None, auth_route("/index.html"));
    }

    #[test]
    fn method_tokens() {
        assert_eq!(Some(Method::Get), Method::from_token("GET"));
        assert_eq!(Some(Method::Post), Method::from_token("POST"));
        assert_eq!(None, Method::from_token("BREW"));
    }
}
