//! HTTP/1.x request parsing.

use std::collections::HashMap;
use thiserror::Error;

/// Largest request head (request line plus headers) accepted.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Largest request body accepted.
pub const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

const MAX_HEADERS: usize = 64;

/// Paths served as `<path>.html` when requested without the suffix.
const DEFAULT_PAGES: [&str; 6] = [
    "/index", "/register", "/login", "/welcome", "/video", "/picture",
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("invalid content-length")]
    BadContentLength,
    #[error("request head too large")]
    HeadTooLarge,
    #[error("request body too large")]
    BodyTooLarge,
}

/// A fully received request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: String,
    path: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    /// Header names lowercased.
    headers: HashMap<String, String>,
    body: Vec<u8>,
    form: HashMap<String, String>,
}

impl Request {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Normalised path, without query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decoded `application/x-www-form-urlencoded` POST fields.
    pub fn form(&self) -> &HashMap<String, String> {
        &self.form
    }

    /// Keep-alive only on HTTP/1.1 with an explicit `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        self.version == 1
            && self
                .header("connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
    }
}

/// Parse one request from the front of `input`.
///
/// Returns `Ok(None)` until the head and the whole body announced by
/// `Content-Length` have arrived. On success also returns the bytes consumed.
pub fn parse(input: &[u8]) -> Result<Option<(Request, usize)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(input)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial if input.len() > MAX_HEAD_SIZE => {
            return Err(ParseError::HeadTooLarge);
        }
        httparse::Status::Partial => return Ok(None),
    };

    let headers: HashMap<String, String> = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();

    let content_length = match headers.get("content-length") {
        Some(v) => v.parse::<usize>().map_err(|_| ParseError::BadContentLength)?,
        None => 0,
    };
    if content_length > MAX_BODY_SIZE {
        return Err(ParseError::BodyTooLarge);
    }
    let total = head_len + content_length;
    if input.len() < total {
        return Ok(None);
    }

    // A complete status guarantees method, path and version are set.
    let method = req.method.unwrap_or_default().to_string();
    let path = normalize_path(req.path.unwrap_or_default());
    let version = req.version.unwrap_or(1);
    let body = input[head_len..total].to_vec();

    let is_form = headers
        .get("content-type")
        .is_some_and(|v| v.eq_ignore_ascii_case("application/x-www-form-urlencoded"));
    let form = if method == "POST" && is_form {
        decode_form(&body)
    } else {
        HashMap::new()
    };

    Ok(Some((
        Request {
            method,
            path,
            version,
            headers,
            body,
            form,
        },
        total,
    )))
}

/// Strip the query string and map the short page names to their files.
pub fn normalize_path(raw: &str) -> String {
    let path = raw.split_once('?').map_or(raw, |(p, _)| p);
    if path == "/" {
        "/index.html".to_string()
    } else if DEFAULT_PAGES.contains(&path) {
        format!("{path}.html")
    } else {
        path.to_string()
    }
}

/// Decode `key=value&key=value` with `+` as space and `%XY` escapes.
pub fn decode_form(body: &[u8]) -> HashMap<String, String> {
    body.split(|&b| b == b'&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = match pair.iter().position(|&b| b == b'=') {
                Some(eq) => (&pair[..eq], &pair[eq + 1..]),
                None => (pair, &pair[pair.len()..]),
            };
            (url_decode(key), url_decode(value))
        })
        .collect()
}

fn url_decode(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < input.len() => {
                match (hex_val(input[i + 1]), hex_val(input[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
