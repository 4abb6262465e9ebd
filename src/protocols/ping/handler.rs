//! Ping protocol handler.

use super::parser::{self, Command, ParseResult};
use crate::runtime::protocol::{Handler, ParseStatus, Response};
use crate::runtime::Buffer;

enum Reply {
    Pong(Option<Vec<u8>>),
    Quit,
    UnknownCommand,
}

/// Stateless apart from the reply owed for the last parsed line.
pub struct PingHandler {
    reply: Option<Reply>,
    keep_alive: bool,
}

impl PingHandler {
    pub fn new() -> Self {
        Self {
            reply: None,
            keep_alive: true,
        }
    }
}

impl Default for PingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for PingHandler {
    fn parse(&mut self, input: &mut Buffer) -> ParseStatus {
        match parser::parse(input.peek()) {
            ParseResult::Incomplete => ParseStatus::Incomplete,
            ParseResult::Complete(command, consumed) => {
                input.retrieve(consumed);
                let reply = match command {
                    Command::Ping => Reply::Pong(None),
                    Command::PingMsg(msg) => Reply::Pong(Some(msg)),
                    Command::Quit => Reply::Quit,
                };
                self.keep_alive = !matches!(reply, Reply::Quit);
                self.reply = Some(reply);
                ParseStatus::Complete
            }
            ParseResult::Error(discard) => {
                input.retrieve(discard);
                self.keep_alive = false;
                self.reply = Some(Reply::UnknownCommand);
                ParseStatus::Invalid
            }
        }
    }

    fn build_response(&mut self, output: &mut Buffer) -> Response {
        let start = output.readable_bytes();
        match self.reply.take() {
            Some(Reply::Pong(None)) => output.append(b"PONG\r\n"),
            Some(Reply::Pong(Some(msg))) => {
                output.append(b"PONG ");
                output.append(&msg);
                output.append(b"\r\n");
            }
            Some(Reply::Quit) => output.append(b"OK\r\n"),
            Some(Reply::UnknownCommand) => output.append(b"ERROR unknown command\r\n"),
            None => {}
        }
        Response {
            body_len: output.readable_bytes() - start,
            payload: None,
        }
    }

    fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }
}
