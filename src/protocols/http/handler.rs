//! HTTP protocol handler.

use super::request::{self, Request};
use super::response::{self, StatusCode};
use crate::runtime::protocol::{Handler, ParseStatus, Response};
use crate::runtime::Buffer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

enum Pending {
    Serve(Request),
    BadRequest,
}

pub struct HttpHandler {
    docroot: Arc<PathBuf>,
    pending: Option<Pending>,
    keep_alive: bool,
}

impl HttpHandler {
    pub fn new(docroot: Arc<PathBuf>) -> Self {
        Self {
            docroot,
            pending: None,
            keep_alive: false,
        }
    }
}

impl Handler for HttpHandler {
    fn parse(&mut self, input: &mut Buffer) -> ParseStatus {
        match request::parse(input.peek()) {
            Ok(None) => ParseStatus::Incomplete,
            Ok(Some((req, consumed))) => {
                input.retrieve(consumed);
                debug!(
                    method = req.method(),
                    path = req.path(),
                    version = req.version(),
                    body_len = req.body().len(),
                    form_fields = req.form().len(),
                    "Request"
                );
                self.keep_alive = req.is_keep_alive();
                self.pending = Some(Pending::Serve(req));
                ParseStatus::Complete
            }
            Err(e) => {
                debug!(error = %e, "Bad request");
                input.retrieve_all();
                self.keep_alive = false;
                self.pending = Some(Pending::BadRequest);
                ParseStatus::Invalid
            }
        }
    }

    fn build_response(&mut self, output: &mut Buffer) -> Response {
        match self.pending.take() {
            Some(Pending::Serve(req)) => {
                response::write_response(&self.docroot, req.path(), self.keep_alive, None, output)
            }
            Some(Pending::BadRequest) => response::write_response(
                &self.docroot,
                "",
                false,
                Some(StatusCode::BadRequest),
                output,
            ),
            None => Response::default(),
        }
    }

    fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }
}
