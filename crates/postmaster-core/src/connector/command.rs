//! POP3 client commands

use std::fmt;

/// Commands the client sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3Command {
    /// USER name
    User { username: String },
    /// PASS secret
    Pass { password: String },
    /// UIDL, multi-line unique id listing
    Uidl,
    /// LIST, multi-line size listing
    List,
    /// RETR msg
    Retr { msg: u32 },
    /// DELE msg
    Dele { msg: u32 },
    /// QUIT
    Quit,
}

impl Pop3Command {
    /// Wire form including the trailing CRLF
    pub fn to_line(&self) -> String {
        match self {
            Pop3Command::User { username } => format!("USER {}\r\n", username),
            Pop3Command::Pass { password } => format!("PASS {}\r\n", password),
            Pop3Command::Uidl => "UIDL\r\n".to_string(),
            Pop3Command::List => "LIST\r\n".to_string(),
            Pop3Command::Retr { msg } => format!("RETR {}\r\n", msg),
            Pop3Command::Dele { msg } => format!("DELE {}\r\n", msg),
            Pop3Command::Quit => "QUIT\r\n".to_string(),
        }
    }

    /// Whether a positive reply is followed by a dot-terminated body
    pub fn is_multiline(&self) -> bool {
        matches!(
            self,
            Pop3Command::Uidl | Pop3Command::List | Pop3Command::Retr { .. }
        )
    }

    /// Verb used in logs and timeout errors
    pub fn verb(&self) -> &'static str {
        match self {
            Pop3Command::User { .. } => "USER",
            Pop3Command::Pass { .. } => "PASS",
            Pop3Command::Uidl => "UIDL",
            Pop3Command::List => "LIST",
            Pop3Command::Retr { .. } => "RETR",
            Pop3Command::Dele { .. } => "DELE",
            Pop3Command::Quit => "QUIT",
        }
    }
}

// Display never prints the password
impl fmt::Display for Pop3Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pop3Command::Pass { .. } => write!(f, "PASS ****"),
            other => write!(f, "{}", other.to_line().trim_end()),
        }
    }
}
