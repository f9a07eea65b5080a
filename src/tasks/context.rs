use crate::imap::{Command, CommandHandle, ImapCapability};
use crate::model::{ConnectionId, ConnectionLink, MailboxNode, MailboxRef, MailboxTree};
use crate::tasks::{TaskError, TaskId};
use std::sync::Arc;

/// Everything a task may touch while one of its callbacks runs
pub struct TaskContext<'a> {
    task: TaskId,
    link: &'a mut ConnectionLink,
    tree: &'a mut Arc<MailboxTree>,
    issued: Vec<CommandHandle>,
    tree_changed: bool,
    close_requested: bool,
}

/// Side effects collected from one callback
pub(crate) struct ContextEffects {
    pub issued: Vec<CommandHandle>,
    pub tree_changed: bool,
    pub close_requested: bool,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        task: TaskId,
        link: &'a mut ConnectionLink,
        tree: &'a mut Arc<MailboxTree>,
    ) -> Self {
        Self {
            task,
            link,
            tree,
            issued: Vec::new(),
            tree_changed: false,
            close_requested: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn connection(&self) -> ConnectionId {
        self.link.id()
    }

    /// Queue a command on this task's connection; the returned handle is owned by the task
    pub fn send(&mut self, command: Command) -> Result<CommandHandle, TaskError> {
        let handle = self
            .link
            .queue(&command)
            .map_err(|e| TaskError::Protocol(e.to_string()))?;
        self.issued.push(handle.clone());
        Ok(handle)
    }

    pub fn tree(&self) -> &MailboxTree {
        &**self.tree
    }

    /// Mutable tree access; the change is published once the callback returns
    pub fn tree_mut(&mut self) -> &mut MailboxTree {
        self.tree_changed = true;
        Arc::make_mut(self.tree)
    }

    pub fn resolve(&self, mailbox: MailboxRef) -> Option<&MailboxNode> {
        self.tree().resolve(mailbox)
    }

    /// Hierarchy delimiter for children of `mailbox`
    pub fn delimiter_for(&self, mailbox: MailboxRef) -> String {
        self.resolve(mailbox)
            .and_then(|node| node.delimiter().map(str::to_string))
            .or_else(|| self.tree().delimiter().map(str::to_string))
            .unwrap_or_else(|| "/".to_string())
    }

    pub fn capabilities(&self) -> &[ImapCapability] {
        &self.link.capabilities
    }

    pub fn has_capability(&self, capability: &ImapCapability) -> bool {
        self.link.capabilities.contains(capability)
    }

    pub fn set_capabilities(&mut self, capabilities: Vec<ImapCapability>) {
        self.link.capabilities = capabilities;
    }

    pub fn selected(&self) -> Option<MailboxRef> {
        self.link.selected
    }

    pub fn set_selected(&mut self, mailbox: Option<MailboxRef>) {
        self.link.selected = mailbox;
    }

    /// Oldest SELECT/EXAMINE on this connection still waiting for its completion
    pub fn pending_select(&self) -> Option<&CommandHandle> {
        self.link.pending_select()
    }

    pub fn greeted(&self) -> bool {
        self.link.greeted
    }

    pub fn mark_greeted(&mut self) {
        self.link.greeted = true;
    }

    /// Ask for the connection to be closed once queued commands are written
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    pub(crate) fn finish(self) -> ContextEffects {
        ContextEffects {
            issued: self.issued,
            tree_changed: self.tree_changed,
            close_requested: self.close_requested,
        }
    }
}
