use crate::imap::{CommandHandle, ImapError, ImapResult, StatusItem};
use base64::{engine::general_purpose, Engine as _};

/// Commands the task engine knows how to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Capability,
    Noop,
    Logout,
    Login { username: String, password: String },
    /// `AUTHENTICATE PLAIN` with the initial response inline (SASL-IR)
    AuthenticatePlain { username: String, password: String },
    Status { mailbox: String, items: Vec<StatusItem> },
    Select { mailbox: String },
    Examine { mailbox: String },
    List { reference: String, pattern: String },
    Create { mailbox: String },
    Delete { mailbox: String },
    Rename { from: String, to: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Capability => "CAPABILITY",
            Command::Noop => "NOOP",
            Command::Logout => "LOGOUT",
            Command::Login { .. } => "LOGIN",
            Command::AuthenticatePlain { .. } => "AUTHENTICATE",
            Command::Status { .. } => "STATUS",
            Command::Select { .. } => "SELECT",
            Command::Examine { .. } => "EXAMINE",
            Command::List { .. } => "LIST",
            Command::Create { .. } => "CREATE",
            Command::Delete { .. } => "DELETE",
            Command::Rename { .. } => "RENAME",
        }
    }

    /// Reject arguments that cannot be sent as a single command line
    pub fn validate(&self) -> ImapResult<()> {
        let arguments: Vec<&str> = match self {
            Command::Capability | Command::Noop | Command::Logout => Vec::new(),
            Command::Login { username, password }
            | Command::AuthenticatePlain { username, password } => vec![username, password],
            Command::Status { mailbox, .. }
            | Command::Select { mailbox }
            | Command::Examine { mailbox }
            | Command::Create { mailbox }
            | Command::Delete { mailbox } => vec![mailbox],
            Command::List { reference, pattern } => vec![reference, pattern],
            Command::Rename { from, to } => vec![from, to],
        };
        match arguments
            .iter()
            .find(|arg| arg.bytes().any(|b| matches!(b, b'\r' | b'\n' | b'\0')))
        {
            Some(arg) => Err(ImapError::invalid_argument(format!(
                "{} argument contains a line break: {:?}",
                self.name(),
                arg
            ))),
            None => Ok(()),
        }
    }

    /// Wire form including tag and CRLF
    pub fn encode(&self, tag: &CommandHandle) -> Vec<u8> {
        format!("{} {}\r\n", tag, self.body()).into_bytes()
    }

    fn body(&self) -> String {
        match self {
            Command::Capability | Command::Noop | Command::Logout => self.name().to_string(),
            Command::Login { username, password } => format!(
                "LOGIN {} {}",
                ImapProtocol::astring(username),
                ImapProtocol::astring(password)
            ),
            Command::AuthenticatePlain { username, password } => format!(
                "AUTHENTICATE PLAIN {}",
                ImapProtocol::sasl_plain(username, password)
            ),
            Command::Status { mailbox, items } => format!(
                "STATUS {} ({})",
                ImapProtocol::astring(mailbox),
                items.iter().map(|i| i.as_str()).collect::<Vec<_>>().join(" ")
            ),
            Command::Select { mailbox } => format!("SELECT {}", ImapProtocol::astring(mailbox)),
            Command::Examine { mailbox } => format!("EXAMINE {}", ImapProtocol::astring(mailbox)),
            Command::List { reference, pattern } => format!(
                "LIST {} {}",
                ImapProtocol::quoted(reference),
                ImapProtocol::quoted(pattern)
            ),
            Command::Create { mailbox } => format!("CREATE {}", ImapProtocol::astring(mailbox)),
            Command::Delete { mailbox } => format!("DELETE {}", ImapProtocol::astring(mailbox)),
            Command::Rename { from, to } => format!(
                "RENAME {} {}",
                ImapProtocol::astring(from),
                ImapProtocol::astring(to)
            ),
        }
    }

    /// Loggable rendering with secrets masked
    pub fn summary(&self) -> String {
        match self {
            Command::Login { username, .. } => {
                format!("LOGIN {} ***", ImapProtocol::astring(username))
            }
            Command::AuthenticatePlain { .. } => "AUTHENTICATE PLAIN ***".to_string(),
            other => other.body(),
        }
    }
}

/// IMAP argument formatting
pub struct ImapProtocol;

impl ImapProtocol {
    /// Send as an atom when every byte is an ATOM-CHAR, otherwise as a quoted string
    pub fn astring(value: &str) -> String {
        let is_atom = !value.is_empty()
            && value.bytes().all(|b| {
                b.is_ascii_graphic() && !matches!(b, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b']')
            });
        if is_atom {
            value.to_string()
        } else {
            Self::quoted(value)
        }
    }

    pub fn quoted(value: &str) -> String {
        let mut out = String::with_capacity(value.len() + 2);
        out.push('"');
        for c in value.chars() {
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
        out
    }

    /// Base64 of `\0username\0password`
    pub fn sasl_plain(username: &str, password: &str) -> String {
        let auth_string = format!("\0{}\0{}", username, password);
        general_purpose::STANDARD.encode(auth_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::TagGenerator;

    fn wire(command: Command) -> String {
        let tag = TagGenerator::new().next_handle();
        String::from_utf8(command.encode(&tag)).unwrap()
    }

    #[test]
    fn test_format_commands() {
        assert_eq!(
            wire(Command::Status {
                mailbox: "INBOX".to_string(),
                items: vec![StatusItem::Messages],
            }),
            "A1 STATUS INBOX (MESSAGES)\r\n"
        );
        assert_eq!(
            wire(Command::List {
                reference: String::new(),
                pattern: "Work/%".to_string(),
            }),
            "A1 LIST \"\" \"Work/%\"\r\n"
        );
        assert_eq!(
            wire(Command::Select {
                mailbox: "Sent Items".to_string()
            }),
            "A1 SELECT \"Sent Items\"\r\n"
        );
        assert_eq!(wire(Command::Noop), "A1 NOOP\r\n");
        assert_eq!(
            wire(Command::Rename {
                from: "Work".to_string(),
                to: "Archive/Old Work".to_string(),
            }),
            "A1 RENAME Work \"Archive/Old Work\"\r\n"
        );
    }

    #[test]
    fn test_quoting_escapes() {
        assert_eq!(ImapProtocol::astring("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(ImapProtocol::astring(""), "\"\"");
        assert_eq!(ImapProtocol::astring("Entwürfe"), "\"Entwürfe\"");
    }

    #[test]
    fn test_authenticate_plain() {
        assert_eq!(ImapProtocol::sasl_plain("user", "pass"), "AHVzZXIAcGFzcw==");
        let command = Command::AuthenticatePlain {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        assert_eq!(command.summary(), "AUTHENTICATE PLAIN ***");
    }

    #[test]
    fn test_login_summary_hides_password() {
        let command = Command::Login {
            username: "user".to_string(),
            password: "hunter2".to_string(),
        };
        assert_eq!(wire(command.clone()), "A1 LOGIN user hunter2\r\n");
        assert!(!command.summary().contains("hunter2"));
    }

    #[test]
    fn test_line_breaks_are_rejected() {
        let command = Command::Create {
            mailbox: "evil\r\nA2 DELETE INBOX".to_string(),
        };
        assert!(matches!(command.validate(), Err(ImapError::InvalidArgument(_))));
        let command = Command::Rename {
            from: "Work".to_string(),
            to: "Play\nA3 LOGOUT".to_string(),
        };
        assert!(matches!(command.validate(), Err(ImapError::InvalidArgument(_))));
        assert!(Command::Noop.validate().is_ok());
    }
}
