//! Units of IMAP work.
//!
//! Every logical operation is an [`ImapTask`]: it issues one or more commands when
//! started and then reacts to the responses the dispatcher routes back to it. Tasks
//! never touch sockets. They talk to their connection and to the mailbox tree through
//! a [`TaskContext`] lent to them for the duration of a single callback.

pub mod context;
pub mod create_connection;
pub mod error;
pub mod list_children;
pub mod mailbox_ops;
pub mod noop;
pub mod number_of_messages;
pub mod select_mailbox;

pub use context::TaskContext;
pub use create_connection::CreateConnectionTask;
pub use error::TaskError;
pub use list_children::ListChildMailboxesTask;
pub use mailbox_ops::{CreateMailboxTask, DeleteMailboxTask, RenameMailboxTask};
pub use noop::NoopTask;
pub use number_of_messages::NumberOfMessagesTask;
pub use select_mailbox::SelectMailboxTask;

use crate::imap::{CommandHandle, ImapCapability, Response, State};
use crate::model::{MailboxRef, MailboxStatus, MailboxTree};
use std::fmt;

/// Identity of a task, assigned in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Task lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Unstarted,
    WaitingOnDependency,
    Queued,
    Running,
    Completed,
    Failed(TaskError),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Unstarted => "unstarted",
            TaskState::WaitingOnDependency => "waiting",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed(_) => "failed",
        }
    }

    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Unstarted, WaitingOnDependency)
            | (Unstarted, Queued)
            | (WaitingOnDependency, Queued)
            | (Queued, Running)
            | (Running, Completed) => true,
            (current, Failed(_)) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Result exposed by a completed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Connected { capabilities: Vec<ImapCapability> },
    MessageCount(u32),
    Mailboxes(Vec<MailboxRef>),
    Selected(MailboxStatus),
    MailboxCreated(MailboxRef),
    MailboxDeleted,
    /// The renamed mailbox; a new node when `INBOX` was renamed
    MailboxRenamed(MailboxRef),
    Noop,
}

pub type TaskOutcome = Result<TaskOutput, TaskError>;

/// What a callback wants to happen to its task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStep {
    Continue,
    Completed(TaskOutput),
    Failed(TaskError),
}

/// Whether a task accepted a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    NotMine,
    Step(TaskStep),
}

/// Behaviour shared by all task kinds
pub trait ImapTask {
    /// Human readable description for activity observers
    fn describe(&self) -> String;

    /// Mailbox the task acts upon
    fn target(&self) -> Option<MailboxRef> {
        None
    }

    /// Issue the task's commands; called once when the task starts running
    fn perform(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep;

    /// Tagged completion of a command this task sent
    fn handle_state(
        &mut self,
        ctx: &mut TaskContext<'_>,
        handle: &CommandHandle,
        state: &State,
    ) -> Handled;

    /// Untagged data seen on the task's connection
    fn handle_untagged(&mut self, ctx: &mut TaskContext<'_>, response: &Response) -> Handled {
        let _ = (ctx, response);
        Handled::NotMine
    }

    /// Protocol-level cleanup before the task is marked cancelled
    fn cancel(&mut self, ctx: &mut TaskContext<'_>) {
        let _ = ctx;
    }
}

/// The closed set of tasks the engine runs
#[derive(Debug)]
pub enum TaskKind {
    CreateConnection(CreateConnectionTask),
    NumberOfMessages(NumberOfMessagesTask),
    ListChildMailboxes(ListChildMailboxesTask),
    SelectMailbox(SelectMailboxTask),
    CreateMailbox(CreateMailboxTask),
    DeleteMailbox(DeleteMailboxTask),
    RenameMailbox(RenameMailboxTask),
    Noop(NoopTask),
}

impl TaskKind {
    fn inner(&self) -> &dyn ImapTask {
        match self {
            TaskKind::CreateConnection(task) => task,
            TaskKind::NumberOfMessages(task) => task,
            TaskKind::ListChildMailboxes(task) => task,
            TaskKind::SelectMailbox(task) => task,
            TaskKind::CreateMailbox(task) => task,
            TaskKind::DeleteMailbox(task) => task,
            TaskKind::RenameMailbox(task) => task,
            TaskKind::Noop(task) => task,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ImapTask {
        match self {
            TaskKind::CreateConnection(task) => task,
            TaskKind::NumberOfMessages(task) => task,
            TaskKind::ListChildMailboxes(task) => task,
            TaskKind::SelectMailbox(task) => task,
            TaskKind::CreateMailbox(task) => task,
            TaskKind::DeleteMailbox(task) => task,
            TaskKind::RenameMailbox(task) => task,
            TaskKind::Noop(task) => task,
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        matches!(self, TaskKind::CreateConnection(_))
    }
}

impl ImapTask for TaskKind {
    fn describe(&self) -> String {
        self.inner().describe()
    }

    fn target(&self) -> Option<MailboxRef> {
        self.inner().target()
    }

    fn perform(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep {
        self.inner_mut().perform(ctx)
    }

    fn handle_state(
        &mut self,
        ctx: &mut TaskContext<'_>,
        handle: &CommandHandle,
        state: &State,
    ) -> Handled {
        self.inner_mut().handle_state(ctx, handle, state)
    }

    fn handle_untagged(&mut self, ctx: &mut TaskContext<'_>, response: &Response) -> Handled {
        self.inner_mut().handle_untagged(ctx, response)
    }

    fn cancel(&mut self, ctx: &mut TaskContext<'_>) {
        self.inner_mut().cancel(ctx)
    }
}

/// Work a caller can ask the engine for; the connection bootstrap is implicit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRequest {
    MessageCount { mailbox: MailboxRef },
    ListChildren { parent: MailboxRef },
    Select { mailbox: MailboxRef, read_only: bool },
    CreateMailbox { parent: MailboxRef, name: String },
    DeleteMailbox { mailbox: MailboxRef },
    RenameMailbox {
        mailbox: MailboxRef,
        new_parent: MailboxRef,
        name: String,
    },
    Noop,
}

impl TaskRequest {
    /// Build the task, labelling it with the mailbox path as it is known right now
    pub(crate) fn into_task(self, tree: &MailboxTree) -> TaskKind {
        let label = |mailbox: MailboxRef| match tree.resolve(mailbox) {
            Some(node) if node.is_root() => "(top level)".to_string(),
            Some(node) => node.path().to_string(),
            None => "(removed mailbox)".to_string(),
        };
        match self {
            TaskRequest::MessageCount { mailbox } => TaskKind::NumberOfMessages(
                NumberOfMessagesTask::new(mailbox, label(mailbox)),
            ),
            TaskRequest::ListChildren { parent } => TaskKind::ListChildMailboxes(
                ListChildMailboxesTask::new(parent, label(parent)),
            ),
            TaskRequest::Select { mailbox, read_only } => TaskKind::SelectMailbox(
                SelectMailboxTask::new(mailbox, label(mailbox), read_only),
            ),
            TaskRequest::CreateMailbox { parent, name } => TaskKind::CreateMailbox(
                CreateMailboxTask::new(parent, label(parent), name),
            ),
            TaskRequest::DeleteMailbox { mailbox } => TaskKind::DeleteMailbox(
                DeleteMailboxTask::new(mailbox, label(mailbox)),
            ),
            TaskRequest::RenameMailbox {
                mailbox,
                new_parent,
                name,
            } => TaskKind::RenameMailbox(RenameMailboxTask::new(
                mailbox,
                label(mailbox),
                new_parent,
                name,
            )),
            TaskRequest::Noop => TaskKind::Noop(NoopTask::new()),
        }
    }
}
