use crate::imap::{Command, CommandHandle, ImapCapability, ImapResult, TagGenerator};
use crate::model::MailboxRef;
use crate::tasks::TaskId;
use std::collections::VecDeque;
use std::fmt;
use tracing::trace;

/// Identity of one physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Transport requested, greeting not seen yet
    Connecting,
    Open,
    /// No new work; queued commands are flushed, then the transport is closed
    Closing,
    Lost,
}

/// A command ready to be written
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    pub handle: CommandHandle,
    pub bytes: Vec<u8>,
    /// Loggable form, secrets masked
    pub summary: String,
}

/// Model-side state of one connection
#[derive(Debug)]
pub struct ConnectionLink {
    id: ConnectionId,
    pub(crate) status: LinkStatus,
    tags: TagGenerator,
    outbound: VecDeque<OutboundCommand>,
    pub(crate) bootstrap: Option<TaskId>,
    pub(crate) capabilities: Vec<ImapCapability>,
    pub(crate) selected: Option<MailboxRef>,
    pub(crate) greeted: bool,
    transport_requested: bool,
    /// SELECT/EXAMINE commands sent and not yet completed, oldest first
    selecting: VecDeque<CommandHandle>,
}

impl ConnectionLink {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            status: LinkStatus::Connecting,
            tags: TagGenerator::new(),
            outbound: VecDeque::new(),
            bootstrap: None,
            capabilities: Vec::new(),
            selected: None,
            greeted: false,
            transport_requested: false,
            selecting: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.status, LinkStatus::Connecting | LinkStatus::Open)
    }

    /// Validate, tag and enqueue a command
    pub(crate) fn queue(&mut self, command: &Command) -> ImapResult<CommandHandle> {
        command.validate()?;
        let handle = self.tags.next_handle();
        trace!(connection = %self.id, tag = %handle, "Queued {}", command.name());
        self.outbound.push_back(OutboundCommand {
            handle: handle.clone(),
            bytes: command.encode(&handle),
            summary: command.summary(),
        });
        if matches!(command, Command::Select { .. } | Command::Examine { .. }) {
            self.selecting.push_back(handle.clone());
        }
        Ok(handle)
    }

    /// Oldest SELECT/EXAMINE still awaiting its completion
    ///
    /// The server answers pipelined selects in order, so untagged mailbox data seen
    /// now belongs to this one.
    pub fn pending_select(&self) -> Option<&CommandHandle> {
        self.selecting.front()
    }

    /// Forget a command once its tagged completion arrived
    pub(crate) fn command_completed(&mut self, handle: &CommandHandle) {
        self.selecting.retain(|pending| pending != handle);
    }

    pub(crate) fn drain_outbound(&mut self) -> Vec<OutboundCommand> {
        self.outbound.drain(..).collect()
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// True exactly once per link
    pub(crate) fn take_transport_request(&mut self) -> bool {
        !std::mem::replace(&mut self.transport_requested, true)
    }
}
