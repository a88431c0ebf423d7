/// Incremental reply parser
///
/// The parser scans the read buffer without consuming it and only advances past
/// a reply once the whole reply is present, so a partially received `VALUE`
/// block or stats listing is simply left for the next read. A parser kept
/// across reads resumes after the last complete record instead of rescanning.
use bytes::{Buf, Bytes, BytesMut};
use std::mem;
use std::str;

use super::{ProtocolError, ReplyKind, Response, ServerErrorKind};
use crate::core::Item;

const CRLF: &[u8] = b"\r\n";

/// Largest value block accepted in a `VALUE` reply
pub const MAX_VALUE_LENGTH: usize = 64 * 1024 * 1024;

/// Parser for the reply to one request
#[derive(Debug)]
pub struct ResponseParser {
    expected: ReplyKind,
    /// Offset just past the last complete record of the reply in progress
    pos: usize,
    items: Vec<Item>,
    entries: Vec<(String, String)>,
}

impl ResponseParser {
    pub fn new(expected: ReplyKind) -> Self {
        Self {
            expected,
            pos: 0,
            items: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Parse one complete reply of the expected kind.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn parse(buf: &mut BytesMut, expected: ReplyKind) -> Result<Option<Response>, ProtocolError> {
        Self::new(expected).resume(buf)
    }

    /// Continue parsing with whatever `buf` holds now; the buffer is only
    /// advanced once the reply is complete.
    pub fn resume(&mut self, buf: &mut BytesMut) -> Result<Option<Response>, ProtocolError> {
        let parsed = match self.expected {
            ReplyKind::Values => self.resume_values(buf),
            ReplyKind::Stats => self.resume_stats(buf),
            expected => self.single_line(buf, expected),
        };

        match parsed {
            Ok(Some(response)) => {
                buf.advance(self.pos);
                self.reset();
                Ok(Some(response))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.items.clear();
        self.entries.clear();
    }

    /// Next line of the reply, with error lines recognized only at its start
    fn next_line<'a>(&self, buf: &'a [u8]) -> Result<Option<(&'a [u8], usize, Option<Response>)>, ProtocolError> {
        let (line, after) = match read_line(buf, self.pos) {
            Some(line) => line,
            None => return Ok(None),
        };
        let error = if self.pos == 0 { parse_error_line(line)? } else { None };
        Ok(Some((line, after, error)))
    }

    fn single_line(&mut self, buf: &[u8], expected: ReplyKind) -> Result<Option<Response>, ProtocolError> {
        let (line, after, error) = match self.next_line(buf)? {
            Some(next) => next,
            None => return Ok(None),
        };
        self.pos = after;
        if error.is_some() {
            return Ok(error);
        }

        let response = match expected {
            ReplyKind::Storage => match line {
                b"STORED" => Response::Stored,
                b"NOT_STORED" => Response::NotStored,
                b"EXISTS" => Response::Exists,
                b"NOT_FOUND" => Response::NotFound,
                _ => return Err(unexpected(expected, line)),
            },
            ReplyKind::Delete => match line {
                b"DELETED" => Response::Deleted,
                b"NOT_FOUND" => Response::NotFound,
                _ => return Err(unexpected(expected, line)),
            },
            ReplyKind::Numeric => match line {
                b"NOT_FOUND" => Response::NotFound,
                digits => {
                    let trimmed = trim_spaces(digits);
                    let value = btoi::btou::<u64>(trimmed).map_err(|_| unexpected(expected, line))?;
                    Response::Numeric(value)
                }
            },
            ReplyKind::Ok => match line {
                b"OK" => Response::Ok,
                _ => return Err(unexpected(expected, line)),
            },
            ReplyKind::Version => {
                let text = str::from_utf8(line)?;
                match text.strip_prefix("VERSION ") {
                    Some(version) => Response::Version(version.trim().to_string()),
                    None => return Err(unexpected(expected, line)),
                }
            }
            ReplyKind::Values | ReplyKind::Stats => return Err(unexpected(expected, line)),
        };
        Ok(Some(response))
    }

    fn resume_values(&mut self, buf: &[u8]) -> Result<Option<Response>, ProtocolError> {
        loop {
            let (line, after, error) = match self.next_line(buf)? {
                Some(next) => next,
                None => return Ok(None),
            };
            if error.is_some() {
                self.pos = after;
                return Ok(error);
            }
            if line == b"END" {
                self.pos = after;
                return Ok(Some(Response::Values(mem::take(&mut self.items))));
            }

            let (key, flags, len, cas) = parse_value_header(line)?;
            if len > MAX_VALUE_LENGTH {
                return Err(ProtocolError::InvalidFormat(format!(
                    "value of {} bytes for {} exceeds the {} byte limit",
                    len, key, MAX_VALUE_LENGTH
                )));
            }
            let data_end = after
                .checked_add(len)
                .ok_or_else(|| ProtocolError::InvalidFormat(format!("value length overflow for {}", key)))?;
            let block_end = data_end
                .checked_add(CRLF.len())
                .ok_or_else(|| ProtocolError::InvalidFormat(format!("value length overflow for {}", key)))?;
            if buf.len() < block_end {
                return Ok(None);
            }
            if &buf[data_end..block_end] != CRLF {
                return Err(ProtocolError::InvalidFormat(format!(
                    "missing terminator after {} data bytes for {}",
                    len, key
                )));
            }

            let data = Bytes::copy_from_slice(&buf[after..data_end]);
            self.items.push(Item::new(key, flags, data, cas));
            self.pos = block_end;
        }
    }

    fn resume_stats(&mut self, buf: &[u8]) -> Result<Option<Response>, ProtocolError> {
        loop {
            let (line, after, error) = match self.next_line(buf)? {
                Some(next) => next,
                None => return Ok(None),
            };
            self.pos = after;
            if error.is_some() {
                return Ok(error);
            }
            if line == b"END" {
                return Ok(Some(Response::Stats(mem::take(&mut self.entries))));
            }
            self.entries.push(parse_stat_line(line)?);
        }
    }
}

/// Find the line starting at `start`; returns its content (without CRLF) and the
/// offset just past the CRLF.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    if start >= buf.len() {
        return None;
    }
    buf[start..]
        .windows(2)
        .position(|w| w == CRLF)
        .map(|offset| (&buf[start..start + offset], start + offset + 2))
}

fn parse_error_line(line: &[u8]) -> Result<Option<Response>, ProtocolError> {
    if line == b"ERROR" {
        return Ok(Some(Response::Error {
            kind: ServerErrorKind::Command,
            message: String::new(),
        }));
    }
    let text = match str::from_utf8(line) {
        Ok(text) => text,
        // Binary-looking lines are not error lines; let the caller decide.
        Err(_) => return Ok(None),
    };
    if let Some(message) = text.strip_prefix("CLIENT_ERROR") {
        return Ok(Some(Response::Error {
            kind: ServerErrorKind::Client,
            message: message.trim().to_string(),
        }));
    }
    if let Some(message) = text.strip_prefix("SERVER_ERROR") {
        return Ok(Some(Response::Error {
            kind: ServerErrorKind::Server,
            message: message.trim().to_string(),
        }));
    }
    Ok(None)
}

/// `VALUE <key> <flags> <bytes> [<cas unique>]`
fn parse_value_header(line: &[u8]) -> Result<(String, u32, usize, Option<u64>), ProtocolError> {
    let text = str::from_utf8(line)?;
    let mut parts = text.split(' ');
    if parts.next() != Some("VALUE") {
        return Err(unexpected(ReplyKind::Values, line));
    }
    let key = parts
        .next()
        .ok_or_else(|| ProtocolError::InvalidFormat(format!("missing key: {}", text)))?;
    let flags = parse_number::<u32>(parts.next(), text)?;
    let len = parse_number::<usize>(parts.next(), text)?;
    let cas = match parts.next() {
        Some(raw) => Some(parse_number::<u64>(Some(raw), text)?),
        None => None,
    };
    Ok((key.to_string(), flags, len, cas))
}

/// `STAT <name> <value>` or, for cachedump, `ITEM <key> [<size> b; <time> s]`
fn parse_stat_line(line: &[u8]) -> Result<(String, String), ProtocolError> {
    let text = str::from_utf8(line)?;
    let rest = text
        .strip_prefix("STAT ")
        .or_else(|| text.strip_prefix("ITEM "))
        .ok_or_else(|| unexpected(ReplyKind::Stats, line))?;
    match rest.split_once(' ') {
        Some((name, value)) => Ok((name.to_string(), value.to_string())),
        None => Ok((rest.to_string(), String::new())),
    }
}

fn parse_number<T: std::str::FromStr>(raw: Option<&str>, line: &str) -> Result<T, ProtocolError> {
    let raw = raw.ok_or_else(|| ProtocolError::InvalidFormat(format!("truncated header: {}", line)))?;
    raw.parse::<T>()
        .map_err(|_| ProtocolError::InvalidFormat(format!("invalid number {} in: {}", raw, line)))
}

fn trim_spaces(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != b' ').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| *b != b' ').map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn unexpected(expected: ReplyKind, line: &[u8]) -> ProtocolError {
    ProtocolError::Unexpected {
        expected,
        line: String::from_utf8_lossy(line).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str, expected: ReplyKind) -> Option<Response> {
        let mut buf = BytesMut::from(input);
        ResponseParser::parse(&mut buf, expected).unwrap()
    }

    #[test]
    fn test_parse_values() {
        let mut buf = BytesMut::from("VALUE a 3 5\r\nhello\r\nVALUE b 0 2 77\r\nhi\r\nEND\r\n");
        let response = ResponseParser::parse(&mut buf, ReplyKind::Values).unwrap().unwrap();
        assert!(buf.is_empty());

        match response {
            Response::Values(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].key, "a");
                assert_eq!(items[0].flags, 3);
                assert_eq!(items[0].data, Bytes::from("hello"));
                assert_eq!(items[0].cas, None);
                assert_eq!(items[1].cas, Some(77));
            }
            other => panic!("Expected values, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_miss() {
        assert_eq!(parse("END\r\n", ReplyKind::Values), Some(Response::Values(vec![])));
    }

    #[test]
    fn test_value_data_may_contain_crlf() {
        let response = parse("VALUE k 0 4\r\na\r\nb\r\nEND\r\n", ReplyKind::Values).unwrap();
        match response {
            Response::Values(items) => assert_eq!(items[0].data, Bytes::from("a\r\nb")),
            other => panic!("Expected values, got {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_value_block_is_not_consumed() {
        let mut buf = BytesMut::from("VALUE a 0 5\r\nhel");
        assert!(ResponseParser::parse(&mut buf, ReplyKind::Values).unwrap().is_none());
        assert_eq!(buf.len(), 16);

        buf.extend_from_slice(b"lo\r\n");
        assert!(ResponseParser::parse(&mut buf, ReplyKind::Values).unwrap().is_none());

        buf.extend_from_slice(b"END\r\n");
        assert!(ResponseParser::parse(&mut buf, ReplyKind::Values).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_storage_and_delete_replies() {
        assert_eq!(parse("STORED\r\n", ReplyKind::Storage), Some(Response::Stored));
        assert_eq!(parse("NOT_STORED\r\n", ReplyKind::Storage), Some(Response::NotStored));
        assert_eq!(parse("EXISTS\r\n", ReplyKind::Storage), Some(Response::Exists));
        assert_eq!(parse("NOT_FOUND\r\n", ReplyKind::Storage), Some(Response::NotFound));
        assert_eq!(parse("DELETED\r\n", ReplyKind::Delete), Some(Response::Deleted));
        assert_eq!(parse("OK\r\n", ReplyKind::Ok), Some(Response::Ok));
    }

    #[test]
    fn test_parse_numeric_reply() {
        assert_eq!(parse("42\r\n", ReplyKind::Numeric), Some(Response::Numeric(42)));
        assert_eq!(parse("7   \r\n", ReplyKind::Numeric), Some(Response::Numeric(7)));
        assert_eq!(parse("NOT_FOUND\r\n", ReplyKind::Numeric), Some(Response::NotFound));
    }

    #[test]
    fn test_parse_server_errors() {
        assert_eq!(
            parse("CLIENT_ERROR cannot increment or decrement non-numeric value\r\n", ReplyKind::Numeric),
            Some(Response::Error {
                kind: ServerErrorKind::Client,
                message: "cannot increment or decrement non-numeric value".to_string(),
            })
        );
        assert_eq!(
            parse("ERROR\r\n", ReplyKind::Storage),
            Some(Response::Error {
                kind: ServerErrorKind::Command,
                message: String::new(),
            })
        );
    }

    #[test]
    fn test_parse_stats_and_cachedump() {
        let response = parse(
            "STAT pid 123\r\nSTAT version 1.6.21\r\nSTAT items:3:number 5\r\nEND\r\n",
            ReplyKind::Stats,
        )
        .unwrap();
        assert_eq!(
            response,
            Response::Stats(vec![
                ("pid".to_string(), "123".to_string()),
                ("version".to_string(), "1.6.21".to_string()),
                ("items:3:number".to_string(), "5".to_string()),
            ])
        );

        let response = parse("ITEM user:1 [5 b; 0 s]\r\nEND\r\n", ReplyKind::Stats).unwrap();
        assert_eq!(
            response,
            Response::Stats(vec![("user:1".to_string(), "[5 b; 0 s]".to_string())])
        );
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse("VERSION 1.6.21\r\n", ReplyKind::Version),
            Some(Response::Version("1.6.21".to_string()))
        );
    }

    #[test]
    fn test_malformed_replies() {
        let mut buf = BytesMut::from("BOGUS\r\n");
        assert!(ResponseParser::parse(&mut buf, ReplyKind::Storage).is_err());

        let mut buf = BytesMut::from("VALUE a zero 1\r\nx\r\nEND\r\n");
        assert!(ResponseParser::parse(&mut buf, ReplyKind::Values).is_err());

        let mut buf = BytesMut::from("VALUE a 0 1\r\nxyEND\r\n");
        assert!(ResponseParser::parse(&mut buf, ReplyKind::Values).is_err());
    }

    #[test]
    fn test_value_length_overflow_is_an_error() {
        let mut buf = BytesMut::from("VALUE k 0 18446744073709551615\r\nabc\r\nEND\r\n");
        let err = ResponseParser::parse(&mut buf, ReplyKind::Values).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFormat(_)));

        let mut buf = BytesMut::from(format!("VALUE k 0 {}\r\n", MAX_VALUE_LENGTH + 1).as_str());
        assert!(ResponseParser::parse(&mut buf, ReplyKind::Values).is_err());
    }

    #[test]
    fn test_resume_across_reads() {
        let mut parser = ResponseParser::new(ReplyKind::Values);
        let mut buf = BytesMut::from("VALUE a 0 5\r\nhello\r\nVALUE b 0 3\r\nby");
        assert!(parser.resume(&mut buf).unwrap().is_none());
        assert_eq!(parser.pos, 20);

        buf.extend_from_slice(b"e\r\nEN");
        assert!(parser.resume(&mut buf).unwrap().is_none());
        assert_eq!(parser.items.len(), 2);

        buf.extend_from_slice(b"D\r\nSTORED\r\n");
        let response = parser.resume(&mut buf).unwrap().unwrap();
        match response {
            Response::Values(items) => {
                assert_eq!(items[0].data, Bytes::from("hello"));
                assert_eq!(items[1].data, Bytes::from("bye"));
            }
            other => panic!("Expected values, got {:?}", other),
        }
        assert_eq!(&buf[..], b"STORED\r\n");
        assert_eq!(parser.pos, 0);

        let mut parser = ResponseParser::new(ReplyKind::Stats);
        let mut buf = BytesMut::from("STAT pid 1\r\nSTAT upt");
        assert!(parser.resume(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ime 9\r\nEND\r\n");
        assert_eq!(
            parser.resume(&mut buf).unwrap(),
            Some(Response::Stats(vec![
                ("pid".to_string(), "1".to_string()),
                ("uptime".to_string(), "9".to_string()),
            ]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_line() {
        let mut buf = BytesMut::from("STORED\r");
        assert!(ResponseParser::parse(&mut buf, ReplyKind::Storage).unwrap().is_none());
    }
}
