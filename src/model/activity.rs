//! Read-only views published for observers such as progress indicators.

use crate::imap::{CommandHandle, ResponseStatus};
use crate::model::{ConnectionId, MailboxTree};
use crate::tasks::{TaskId, TaskState};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 256;
const MAX_UNROUTED: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub id: TaskId,
    pub description: String,
    pub state: TaskState,
    pub connection: ConnectionId,
}

/// Non-terminal tasks at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivitySnapshot {
    pub active: usize,
    pub tasks: Vec<TaskSummary>,
}

impl ActivitySnapshot {
    pub fn is_busy(&self) -> bool {
        self.active > 0
    }

    pub fn descriptions(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.description.as_str()).collect()
    }
}

/// One lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub id: TaskId,
    pub description: String,
    pub state: TaskState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnroutedReason {
    /// No task owns the tag on this connection
    UnknownHandle,
    /// The owner did not accept the response
    Refused { task: TaskId },
    /// The owner had already finished (cancelled, failed or invalidated) when it arrived
    TaskFinished { task: TaskId },
}

/// A tagged response that reached no task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnroutedResponse {
    pub connection: ConnectionId,
    pub tag: CommandHandle,
    pub status: ResponseStatus,
    pub text: String,
    pub reason: UnroutedReason,
}

/// Counters for things the dispatcher had to drop
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Most recent unrouted responses, oldest first
    pub unrouted: Vec<UnroutedResponse>,
    pub decode_errors: u64,
    /// Untagged responses no live task accepted
    pub unclaimed_untagged: u64,
}

impl Diagnostics {
    pub(crate) fn record_unrouted(&mut self, unrouted: UnroutedResponse) {
        if self.unrouted.len() == MAX_UNROUTED {
            self.unrouted.remove(0);
        }
        self.unrouted.push(unrouted);
    }
}

/// Publishing side of the observer channels
pub struct Observers {
    activity: watch::Sender<ActivitySnapshot>,
    tree: watch::Sender<Arc<MailboxTree>>,
    events: broadcast::Sender<TaskEvent>,
}

impl Observers {
    pub fn new(tree: Arc<MailboxTree>) -> Self {
        let (activity, _) = watch::channel(ActivitySnapshot::default());
        let (tree, _) = watch::channel(tree);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            activity,
            tree,
            events,
        }
    }

    pub fn publish_activity(&self, snapshot: ActivitySnapshot) {
        self.activity.send_replace(snapshot);
    }

    pub fn publish_tree(&self, tree: Arc<MailboxTree>) {
        self.tree.send_replace(tree);
    }

    pub fn emit(&self, event: TaskEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe_activity(&self) -> watch::Receiver<ActivitySnapshot> {
        self.activity.subscribe()
    }

    pub fn subscribe_tree(&self) -> watch::Receiver<Arc<MailboxTree>> {
        self.tree.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<TaskEvent> {
        self.events.clone()
    }
}
