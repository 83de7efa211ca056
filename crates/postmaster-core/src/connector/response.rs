//! POP3 reply parsing
//!
//! Status lines start with `+OK` or `-ERR`. Multi-line bodies end with a
//! line holding a single `.`; lines starting with a dot carry an extra
//! leading dot that the reader strips.

use super::{MessageId, Pop3Error};

/// A status line from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pop3Reply {
    pub positive: bool,
    pub text: String,
}

impl Pop3Reply {
    /// Parse a status line, with or without the line terminator
    pub fn parse(line: &str) -> Result<Self, Pop3Error> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(rest) = line.strip_prefix("+OK") {
            return Ok(Self {
                positive: true,
                text: rest.trim_start().to_string(),
            });
        }
        if let Some(rest) = line.strip_prefix("-ERR") {
            return Ok(Self {
                positive: false,
                text: rest.trim_start().to_string(),
            });
        }

        Err(Pop3Error::Protocol(format!(
            "unexpected status line: {:?}",
            truncate(line, 80)
        )))
    }

    /// Turn a negative reply into [`Pop3Error::Negative`]
    pub fn into_result(self) -> Result<Self, Pop3Error> {
        if self.positive {
            Ok(self)
        } else {
            Err(Pop3Error::Negative(self.text))
        }
    }
}

/// Whether `line` is the multi-line terminator
pub(crate) fn is_terminator(line: &[u8]) -> bool {
    matches!(line, b".\r\n" | b".\n" | b".")
}

/// Remove the byte-stuffed leading dot
pub(crate) fn unstuff(line: &[u8]) -> &[u8] {
    if line.starts_with(b"..") {
        &line[1..]
    } else {
        line
    }
}

/// Parse a `UIDL` body line: `<seq> <uid>`
pub(crate) fn parse_uidl_line(line: &str) -> Result<MessageId, Pop3Error> {
    let mut parts = line.split_whitespace();
    let seq = parse_seq(parts.next(), line)?;
    let uid = parts
        .next()
        .ok_or_else(|| Pop3Error::Protocol(format!("malformed UIDL line: {:?}", line)))?;

    Ok(MessageId {
        seq,
        uid: uid.to_string(),
        size: None,
    })
}

/// Parse a `LIST` body line: `<seq> <size>`
pub(crate) fn parse_list_line(line: &str) -> Result<MessageId, Pop3Error> {
    let mut parts = line.split_whitespace();
    let seq = parse_seq(parts.next(), line)?;
    let size = parts.next().and_then(|s| s.parse::<u64>().ok());

    Ok(MessageId {
        seq,
        uid: seq.to_string(),
        size,
    })
}

fn parse_seq(token: Option<&str>, line: &str) -> Result<u32, Pop3Error> {
    token
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|seq| *seq > 0)
        .ok_or_else(|| Pop3Error::Protocol(format!("malformed listing line: {:?}", line)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let ok = Pop3Reply::parse("+OK POP3 server ready\r\n").unwrap();
        assert!(ok.positive);
        assert_eq!(ok.text, "POP3 server ready");

        let bare = Pop3Reply::parse("+OK").unwrap();
        assert!(bare.positive);
        assert_eq!(bare.text, "");

        let err = Pop3Reply::parse("-ERR No such message\r\n").unwrap();
        assert!(!err.positive);
        assert!(err.into_result().unwrap_err().is_no_such_message());

        assert!(matches!(
            Pop3Reply::parse("* OK imap"),
            Err(Pop3Error::Protocol(_))
        ));
    }

    #[test]
    fn test_unstuff() {
        assert_eq!(unstuff(b"..hidden\r\n"), b".hidden\r\n");
        assert_eq!(unstuff(b"plain\r\n"), b"plain\r\n");
        assert!(is_terminator(b".\r\n"));
        assert!(!is_terminator(b"..\r\n"));
    }

    #[test]
    fn test_listing_lines() {
        let uidl = parse_uidl_line("2 uid-2").unwrap();
        assert_eq!(uidl.seq, 2);
        assert_eq!(uidl.uid, "uid-2");
        assert_eq!(uidl.size, None);

        let list = parse_list_line("3 1024").unwrap();
        assert_eq!(list.uid, "3");
        assert_eq!(list.size, Some(1024));

        assert!(parse_uidl_line("2").is_err());
        assert!(parse_list_line("x 10").is_err());
        assert!(parse_list_line("0 10").is_err());
    }
}
