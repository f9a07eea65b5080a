//! IMAP wire layer: response decoding, command encoding, tags and transports.

pub mod connection;
pub mod error;
pub mod handle;
pub mod parser;
pub mod protocol;
pub mod types;

pub use connection::{BoxedStream, Connector, ImapStream, Inbound, ResponseReader, TcpConnector};
pub use error::{ImapError, ImapResult};
pub use handle::{CommandHandle, TagGenerator};
pub use parser::{DecodeError, Parser};
pub use protocol::{Command, ImapProtocol};
pub use types::*;
