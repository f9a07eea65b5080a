use crate::imap::{same_mailbox, Command, CommandHandle, ResponseStatus, State};
use crate::model::{MailboxRef, MailboxStatus};
use crate::tasks::{Handled, ImapTask, TaskContext, TaskError, TaskOutput, TaskStep};

/// `CREATE <parent><delimiter><name>`
#[derive(Debug)]
pub struct CreateMailboxTask {
    parent: MailboxRef,
    label: String,
    name: String,
    created: Option<(String, String)>,
    tag: Option<CommandHandle>,
}

impl CreateMailboxTask {
    pub fn new(parent: MailboxRef, label: String, name: String) -> Self {
        Self {
            parent,
            label,
            name,
            created: None,
            tag: None,
        }
    }
}

impl ImapTask for CreateMailboxTask {
    fn describe(&self) -> String {
        format!("Creating {} under {}", self.name, self.label)
    }

    fn target(&self) -> Option<MailboxRef> {
        Some(self.parent)
    }

    fn perform(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep {
        let Some(parent) = ctx.resolve(self.parent) else {
            return TaskStep::Failed(TaskError::TargetInvalidated);
        };
        let delimiter = ctx.delimiter_for(self.parent);
        if self.name.is_empty() || self.name.contains(delimiter.as_str()) {
            return TaskStep::Failed(TaskError::Protocol(format!(
                "invalid mailbox name {:?}",
                self.name
            )));
        }
        let path = if parent.is_root() {
            self.name.clone()
        } else {
            format!("{}{}{}", parent.path(), delimiter, self.name)
        };
        match ctx.send(Command::Create {
            mailbox: path.clone(),
        }) {
            Ok(handle) => {
                self.tag = Some(handle);
                self.created = Some((path, delimiter));
                TaskStep::Continue
            }
            Err(e) => TaskStep::Failed(e),
        }
    }

    fn handle_state(
        &mut self,
        ctx: &mut TaskContext<'_>,
        handle: &CommandHandle,
        state: &State,
    ) -> Handled {
        if self.tag.as_ref() != Some(handle) {
            return Handled::NotMine;
        }
        self.tag = None;
        if state.status != ResponseStatus::Ok {
            return Handled::Step(TaskStep::Failed(TaskError::rejected(
                state.status,
                &state.text,
            )));
        }
        let Some((path, delimiter)) = self.created.take() else {
            return Handled::Step(TaskStep::Failed(TaskError::Protocol(
                "CREATE completed before it was sent".to_string(),
            )));
        };
        let step = match ctx
            .tree_mut()
            .insert_child(self.parent, &self.name, &path, Some(delimiter), Vec::new())
        {
            Some(mailbox) => TaskStep::Completed(TaskOutput::MailboxCreated(mailbox)),
            None => TaskStep::Failed(TaskError::TargetInvalidated),
        };
        Handled::Step(step)
    }
}

/// `DELETE <mailbox>`; removes the node and its subtree on success
#[derive(Debug)]
pub struct DeleteMailboxTask {
    mailbox: MailboxRef,
    label: String,
    tag: Option<CommandHandle>,
}

impl DeleteMailboxTask {
    pub fn new(mailbox: MailboxRef, label: String) -> Self {
        Self {
            mailbox,
            label,
            tag: None,
        }
    }
}

impl ImapTask for DeleteMailboxTask {
    fn describe(&self) -> String {
        format!("Deleting {}", self.label)
    }

    fn target(&self) -> Option<MailboxRef> {
        Some(self.mailbox)
    }

    fn perform(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep {
        let Some(node) = ctx.resolve(self.mailbox) else {
            return TaskStep::Failed(TaskError::TargetInvalidated);
        };
        if node.is_root() {
            return TaskStep::Failed(TaskError::Protocol(
                "the top level cannot be deleted".to_string(),
            ));
        }
        let mailbox = node.path().to_string();
        match ctx.send(Command::Delete { mailbox }) {
            Ok(handle) => {
                self.tag = Some(handle);
                TaskStep::Continue
            }
            Err(e) => TaskStep::Failed(e),
        }
    }

    fn handle_state(
        &mut self,
        ctx: &mut TaskContext<'_>,
        handle: &CommandHandle,
        state: &State,
    ) -> Handled {
        if self.tag.as_ref() != Some(handle) {
            return Handled::NotMine;
        }
        self.tag = None;
        if state.status != ResponseStatus::Ok {
            return Handled::Step(TaskStep::Failed(TaskError::rejected(
                state.status,
                &state.text,
            )));
        }
        if ctx.selected() == Some(self.mailbox) {
            ctx.set_selected(None);
        }
        ctx.tree_mut().remove(self.mailbox);
        Handled::Step(TaskStep::Completed(TaskOutput::MailboxDeleted))
    }
}

/// `RENAME <mailbox> <new parent><delimiter><name>`
///
/// The node keeps its slot, so references to it and to everything below it stay
/// valid. Renaming `INBOX` moves its messages into a new mailbox and leaves an empty
/// `INBOX` behind.
#[derive(Debug)]
pub struct RenameMailboxTask {
    mailbox: MailboxRef,
    label: String,
    new_parent: MailboxRef,
    name: String,
    renamed: Option<(String, String)>,
    tag: Option<CommandHandle>,
}

impl RenameMailboxTask {
    pub fn new(mailbox: MailboxRef, label: String, new_parent: MailboxRef, name: String) -> Self {
        Self {
            mailbox,
            label,
            new_parent,
            name,
            renamed: None,
            tag: None,
        }
    }

    fn is_inbox(&self, ctx: &TaskContext<'_>) -> bool {
        ctx.resolve(self.mailbox)
            .map_or(false, |node| same_mailbox(node.path(), "INBOX"))
    }
}

impl ImapTask for RenameMailboxTask {
    fn describe(&self) -> String {
        format!("Renaming {} to {}", self.label, self.name)
    }

    fn target(&self) -> Option<MailboxRef> {
        Some(self.mailbox)
    }

    fn perform(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep {
        let Some(node) = ctx.resolve(self.mailbox) else {
            return TaskStep::Failed(TaskError::TargetInvalidated);
        };
        if node.is_root() {
            return TaskStep::Failed(TaskError::Protocol(
                "the top level cannot be renamed".to_string(),
            ));
        }
        let from = node.path().to_string();
        let Some(parent) = ctx.resolve(self.new_parent) else {
            return TaskStep::Failed(TaskError::TargetInvalidated);
        };
        let parent_is_root = parent.is_root();
        let parent_path = parent.path().to_string();

        let mut cursor = Some(self.new_parent);
        while let Some(current) = cursor {
            if current == self.mailbox {
                return TaskStep::Failed(TaskError::Protocol(format!(
                    "{} cannot be moved below itself",
                    from
                )));
            }
            cursor = ctx.resolve(current).and_then(|node| node.parent());
        }

        let delimiter = ctx.delimiter_for(self.new_parent);
        if self.name.is_empty() || self.name.contains(delimiter.as_str()) {
            return TaskStep::Failed(TaskError::Protocol(format!(
                "invalid mailbox name {:?}",
                self.name
            )));
        }
        let to = if parent_is_root {
            self.name.clone()
        } else {
            format!("{}{}{}", parent_path, delimiter, self.name)
        };
        match ctx.send(Command::Rename {
            from,
            to: to.clone(),
        }) {
            Ok(handle) => {
                self.tag = Some(handle);
                self.renamed = Some((to, delimiter));
                TaskStep::Continue
            }
            Err(e) => TaskStep::Failed(e),
        }
    }

    fn handle_state(
        &mut self,
        ctx: &mut TaskContext<'_>,
        handle: &CommandHandle,
        state: &State,
    ) -> Handled {
        if self.tag.as_ref() != Some(handle) {
            return Handled::NotMine;
        }
        self.tag = None;
        if state.status != ResponseStatus::Ok {
            return Handled::Step(TaskStep::Failed(TaskError::rejected(
                state.status,
                &state.text,
            )));
        }
        let Some((path, delimiter)) = self.renamed.take() else {
            return Handled::Step(TaskStep::Failed(TaskError::Protocol(
                "RENAME completed before it was sent".to_string(),
            )));
        };

        if self.is_inbox(ctx) {
            let tree = ctx.tree_mut();
            tree.update_status(self.mailbox, |status| *status = MailboxStatus::default());
            let created =
                tree.insert_child(self.new_parent, &self.name, &path, Some(delimiter), Vec::new());
            let step = match created {
                Some(mailbox) => TaskStep::Completed(TaskOutput::MailboxRenamed(mailbox)),
                None => TaskStep::Failed(TaskError::TargetInvalidated),
            };
            return Handled::Step(step);
        }

        let step = if ctx.tree_mut().relocate(self.mailbox, self.new_parent, &path) {
            TaskStep::Completed(TaskOutput::MailboxRenamed(self.mailbox))
        } else {
            TaskStep::Failed(TaskError::TargetInvalidated)
        };
        Handled::Step(step)
    }
}
