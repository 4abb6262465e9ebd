//! Echo protocol handler.

use super::parser::{self, ParseError, Request};
use crate::runtime::protocol::{Handler, ParseStatus, Payload, Response};
use crate::runtime::Buffer;

enum Reply {
    Echo(bytes::Bytes),
    Quit,
    Error(ParseError),
}

pub struct EchoHandler {
    reply: Option<Reply>,
    keep_alive: bool,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self {
            reply: None,
            keep_alive: true,
        }
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for EchoHandler {
    fn parse(&mut self, input: &mut Buffer) -> ParseStatus {
        match parser::parse(input.peek()) {
            Ok(None) => ParseStatus::Incomplete,
            Ok(Some((request, consumed))) => {
                input.retrieve(consumed);
                self.keep_alive = request != Request::Quit;
                self.reply = Some(match request {
                    Request::Echo(data) => Reply::Echo(data),
                    Request::Quit => Reply::Quit,
                });
                ParseStatus::Complete
            }
            Err(e) => {
                // Framing is lost; the connection closes after the reply.
                input.retrieve_all();
                self.keep_alive = false;
                self.reply = Some(Reply::Error(e));
                ParseStatus::Invalid
            }
        }
    }

    fn build_response(&mut self, output: &mut Buffer) -> Response {
        match self.reply.take() {
            Some(Reply::Echo(data)) => {
                output.append(format!("{}\r\n", data.len()).as_bytes());
                Response {
                    body_len: data.len(),
                    payload: Some(Payload::Shared(data)),
                }
            }
            Some(Reply::Quit) => {
                output.append(b"OK\r\n");
                Response::default()
            }
            Some(Reply::Error(e)) => {
                output.append(format!("ERROR {e}\r\n").as_bytes());
                Response::default()
            }
            None => Response::default(),
        }
    }

    fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }
}
