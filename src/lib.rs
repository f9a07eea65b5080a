pub mod cli;
pub mod config;
pub mod engine;
pub mod imap;
pub mod model;
pub mod tasks;

pub use config::{AuthMechanism, Credentials, EngineConfig, ServerConfig};
pub use engine::{Engine, EngineHandle, TaskTicket};
pub use imap::{CommandHandle, Connector, ImapError, ImapResult, TcpConnector};
pub use model::{ActivitySnapshot, MailboxRef, MailboxTree, Model, TaskEvent};
pub use tasks::{ImapTask, TaskError, TaskId, TaskOutput, TaskRequest, TaskState};
