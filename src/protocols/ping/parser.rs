//! Ping protocol parser.

/// Longest accepted command line, excluding `\r\n`.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    /// Ping with a message to echo back.
    PingMsg(Vec<u8>),
    Quit,
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Command plus bytes consumed, including the line ending.
    Complete(Command, usize),
    Incomplete,
    /// Unknown command or overlong line. Carries bytes to discard.
    Error(usize),
}

/// Parse one command line from the front of `input`.
pub fn parse(input: &[u8]) -> ParseResult {
    let Some(line_end) = input.windows(2).position(|w| w == b"\r\n") else {
        if input.len() > MAX_LINE_LENGTH {
            return ParseResult::Error(input.len());
        }
        return ParseResult::Incomplete;
    };

    let line = &input[..line_end];
    let consumed = line_end + 2;

    if line.len() > MAX_LINE_LENGTH {
        ParseResult::Error(consumed)
    } else if line.eq_ignore_ascii_case(b"PING") {
        ParseResult::Complete(Command::Ping, consumed)
    } else if line.eq_ignore_ascii_case(b"QUIT") {
        ParseResult::Complete(Command::Quit, consumed)
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        ParseResult::Complete(Command::PingMsg(line[5..].to_vec()), consumed)
    } else {
        ParseResult::Error(consumed)
    }
}
