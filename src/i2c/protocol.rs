//! I2C proxy line protocol
//!
//! Requests go out as single `\n`-terminated ASCII lines with decimal
//! arguments. The proxy answers each request with one `\r\n`-terminated line.
//! Poll pushes arrive on the second socket as `{id}: {v1} ... {vn}`.

use super::poll::PollId;
use crate::error::{Error, Result};
use std::fmt;

/// Largest register count a single `get`/`addpoll` may ask for
pub const MAX_REGISTER_COUNT: usize = 255;

/// Request sent on the command socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Ping,
    Set {
        address: u8,
        register: u8,
        value: u8,
    },
    Get {
        address: u8,
        register: u8,
    },
    GetMany {
        address: u8,
        register: u8,
        count: usize,
    },
    AddPoll {
        delay_ms: u32,
        address: u8,
        register: u8,
        count: usize,
    },
    RemovePoll {
        id: PollId,
    },
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Request::Ping => write!(f, "ping"),
            Request::Set {
                address,
                register,
                value,
            } => write!(f, "set {address} {register} {value}"),
            Request::Get { address, register } => write!(f, "get {address} {register}"),
            Request::GetMany {
                address,
                register,
                count,
            } => write!(f, "get {address} {register} {count}"),
            Request::AddPoll {
                delay_ms,
                address,
                register,
                count,
            } => write!(f, "addpoll {delay_ms} {address} {register} {count}"),
            Request::RemovePoll { id } => write!(f, "rmpoll {id}"),
        }
    }
}

/// Check a register count is in `1..=255`
pub fn validate_count(count: usize) -> Result<()> {
    if (1..=MAX_REGISTER_COUNT).contains(&count) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "register count {count} outside 1..={MAX_REGISTER_COUNT}"
        )))
    }
}

/// Strip the trailing line terminator (`\n` or `\r\n`)
pub fn trim_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

fn unexpected(response: &str) -> Error {
    Error::Protocol(format!("unexpected response '{response}'"))
}

/// Expect a bare `OK`
pub fn parse_ok(response: &str) -> Result<()> {
    if response == "OK" {
        Ok(())
    } else {
        Err(unexpected(response))
    }
}

/// Parse a single register value
pub fn parse_byte(response: &str) -> Result<u8> {
    response.parse::<u8>().map_err(|_| unexpected(response))
}

/// Parse exactly `count` space-separated register values
pub fn parse_bytes(response: &str, count: usize) -> Result<Vec<u8>> {
    let values = response
        .split(' ')
        .map(str::parse::<u8>)
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| unexpected(response))?;
    if values.len() != count {
        return Err(Error::Protocol(format!(
            "expected {count} values, got '{response}'"
        )));
    }
    Ok(values)
}

/// Parse the `OK {id}` answer to `addpoll`
pub fn parse_poll_id(response: &str) -> Result<PollId> {
    response
        .strip_prefix("OK ")
        .and_then(|id| id.parse::<PollId>().ok())
        .ok_or_else(|| unexpected(response))
}

/// A poll push split at its id prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollLine<'a> {
    pub id: PollId,
    /// Everything after `{id}:`
    pub payload: &'a str,
}

/// Split a poll line into id and payload.
///
/// A line without a colon or with a non-numeric id means the stream is
/// corrupt and is returned as [`Error::Protocol`].
pub fn parse_poll_line(line: &str) -> Result<PollLine<'_>> {
    let line = trim_line_ending(line);
    let (id, payload) = line
        .split_once(':')
        .ok_or_else(|| Error::Protocol(format!("poll line without id: '{line}'")))?;
    let id = id
        .parse::<PollId>()
        .map_err(|_| Error::Protocol(format!("poll line with bad id: '{line}'")))?;
    Ok(PollLine { id, payload })
}

/// Decode the values of a poll push.
///
/// Returns `None` when the token count differs from `count` or a token is not
/// an integer, which is also how the proxy reports a failed I2C read
/// (`{id}: ERROR`).
pub fn parse_poll_values(payload: &str, count: usize) -> Option<Vec<i32>> {
    let values = payload
        .split_whitespace()
        .map(str::parse::<i32>)
        .collect::<std::result::Result<Vec<i32>, _>>()
        .ok()?;
    (values.len() == count).then_some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        assert_eq!(Request::Ping.to_string(), "ping");
        assert_eq!(
            Request::Set {
                address: 0x10,
                register: 2,
                value: 200
            }
            .to_string(),
            "set 16 2 200"
        );
        assert_eq!(
            Request::GetMany {
                address: 0x35,
                register: 0x0E,
                count: 2
            }
            .to_string(),
            "get 53 14 2"
        );
        assert_eq!(
            Request::AddPoll {
                delay_ms: 1000,
                address: 0x70,
                register: 2,
                count: 2
            }
            .to_string(),
            "addpoll 1000 112 2 2"
        );
        assert_eq!(Request::RemovePoll { id: 7 }.to_string(), "rmpoll 7");
    }

    #[test]
    fn test_count_bounds() {
        assert!(validate_count(0).is_err());
        assert!(validate_count(1).is_ok());
        assert!(validate_count(255).is_ok());
        assert!(matches!(validate_count(256), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending("OK\r\n"), "OK");
        assert_eq!(trim_line_ending("OK\n"), "OK");
        assert_eq!(trim_line_ending("OK"), "OK");
    }

    #[test]
    fn test_parse_responses() {
        assert!(parse_ok("OK").is_ok());
        assert!(parse_ok("ERROR").is_err());
        assert_eq!(parse_byte("255").unwrap(), 255);
        assert!(parse_byte("256").is_err());
        assert!(parse_byte("ERROR").is_err());
        assert_eq!(parse_bytes("1 2 3", 3).unwrap(), vec![1, 2, 3]);
        assert!(parse_bytes("1 2", 3).is_err());
        assert!(parse_bytes("1 x 3", 3).is_err());
        assert_eq!(parse_poll_id("OK 12").unwrap(), 12);
        assert!(parse_poll_id("OK").is_err());
        assert!(parse_poll_id("ERROR").is_err());
    }

    #[test]
    fn test_parse_poll_line() {
        let line = parse_poll_line("3: 10 20\r\n").unwrap();
        assert_eq!(line.id, 3);
        assert_eq!(parse_poll_values(line.payload, 2), Some(vec![10, 20]));
        assert_eq!(parse_poll_values(line.payload, 1), None);

        let err_line = parse_poll_line("4: ERROR\r\n").unwrap();
        assert_eq!(parse_poll_values(err_line.payload, 1), None);

        assert!(matches!(parse_poll_line("garbage\n"), Err(Error::Protocol(_))));
        assert!(matches!(parse_poll_line("x1: 5\n"), Err(Error::Protocol(_))));
    }
}
