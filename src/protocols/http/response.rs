//! HTTP response construction for static files.

use crate::runtime::protocol::{MappedFile, Payload, Response};
use crate::runtime::Buffer;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;

/// Others-may-read permission bit.
const WORLD_READABLE: u32 = 0o004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
        }
    }

    /// Page served in place of the requested file.
    pub fn error_page(self) -> Option<&'static str> {
        match self {
            StatusCode::Ok => None,
            StatusCode::BadRequest => Some("/400.html"),
            StatusCode::Forbidden => Some("/403.html"),
            StatusCode::NotFound => Some("/404.html"),
        }
    }
}

/// MIME type by file suffix, `text/plain` when unknown.
pub fn content_type(path: &str) -> &'static str {
    let Some(dot) = path.rfind('.') else {
        return "text/plain";
    };
    match &path[dot..] {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/msword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

/// Decide the status for serving `path` from `docroot`.
pub fn resolve_status(docroot: &Path, path: &str) -> StatusCode {
    if path.split('/').any(|segment| segment == "..") {
        return StatusCode::Forbidden;
    }
    match fs::metadata(join(docroot, path)) {
        Err(_) => StatusCode::NotFound,
        Ok(meta) if meta.is_dir() => StatusCode::NotFound,
        Ok(meta) if meta.permissions().mode() & WORLD_READABLE == 0 => StatusCode::Forbidden,
        Ok(_) => StatusCode::Ok,
    }
}

/// Append status line, headers and (inline or mapped) body for `path`.
///
/// `forced` skips file resolution, as for a request that failed to parse.
pub fn write_response(
    docroot: &Path,
    path: &str,
    keep_alive: bool,
    forced: Option<StatusCode>,
    output: &mut Buffer,
) -> Response {
    let status = forced.unwrap_or_else(|| resolve_status(docroot, path));
    let path = status.error_page().unwrap_or(path);

    output.append(format!("HTTP/1.1 {} {}\r\n", status.code(), status.reason()).as_bytes());
    if keep_alive {
        output.append(b"Connection: keep-alive\r\n");
        output.append(b"keep-alive: max=6, timeout=120\r\n");
    } else {
        output.append(b"Connection: close\r\n");
    }
    output.append(format!("Content-type: {}\r\n", content_type(path)).as_bytes());
    output.append(
        chrono::Utc::now()
            .format("Date: %a, %d %b %Y %H:%M:%S GMT\r\n")
            .to_string()
            .as_bytes(),
    );

    match map_body(&join(docroot, path)) {
        Ok(payload) => {
            let body_len = payload.as_ref().map_or(0, Payload::len);
            output.append(format!("Content-length: {body_len}\r\n\r\n").as_bytes());
            Response { body_len, payload }
        }
        Err(e) => {
            debug!(path, error = %e, "Cannot map response body");
            let body_len = error_content(status, "File NotFound!", output);
            Response {
                body_len,
                payload: None,
            }
        }
    }
}

/// Map the file at `path`, or `None` for an empty file.
fn map_body(path: &Path) -> std::io::Result<Option<Payload>> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    Ok(Some(Payload::Mapped(MappedFile::map(&file)?)))
}

/// Inline HTML error body, used when no file can be served.
fn error_content(status: StatusCode, message: &str, output: &mut Buffer) -> usize {
    let body = format!(
        "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>oneshot-httpd</em></body></html>",
        status.code(),
        status.reason(),
        message
    );
    output.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
    output.append(body.as_bytes());
    body.len()
}

fn join(docroot: &Path, path: &str) -> std::path::PathBuf {
    docroot.join(path.trim_start_matches('/'))
}
