use crate::imap::{
    same_mailbox, Command, CommandHandle, Response, ResponseStatus, State, StatusItem,
    UntaggedData,
};
use crate::model::MailboxRef;
use crate::tasks::{Handled, ImapTask, TaskContext, TaskError, TaskOutput, TaskStep};

/// `STATUS <mailbox> (MESSAGES)`
#[derive(Debug)]
pub struct NumberOfMessagesTask {
    mailbox: MailboxRef,
    label: String,
    path: Option<String>,
    tag: Option<CommandHandle>,
    messages: Option<u32>,
}

impl NumberOfMessagesTask {
    pub fn new(mailbox: MailboxRef, label: String) -> Self {
        Self {
            mailbox,
            label,
            path: None,
            tag: None,
            messages: None,
        }
    }
}

impl ImapTask for NumberOfMessagesTask {
    fn describe(&self) -> String {
        format!("Counting messages in {}", self.label)
    }

    fn target(&self) -> Option<MailboxRef> {
        Some(self.mailbox)
    }

    fn perform(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep {
        let Some(node) = ctx.resolve(self.mailbox) else {
            return TaskStep::Failed(TaskError::TargetInvalidated);
        };
        let path = node.path().to_string();
        let command = Command::Status {
            mailbox: path.clone(),
            items: vec![StatusItem::Messages],
        };
        match ctx.send(command) {
            Ok(handle) => {
                self.tag = Some(handle);
                self.path = Some(path);
                TaskStep::Continue
            }
            Err(e) => TaskStep::Failed(e),
        }
    }

    fn handle_untagged(&mut self, ctx: &mut TaskContext<'_>, response: &Response) -> Handled {
        let Response::Data(UntaggedData::Status { mailbox, items }) = response else {
            return Handled::NotMine;
        };
        let ours = self.tag.is_some()
            && self.path.as_deref().map_or(false, |path| same_mailbox(path, mailbox));
        if !ours {
            return Handled::NotMine;
        }
        for (item, value) in items {
            if *item == StatusItem::Messages {
                self.messages = Some(*value);
            }
        }
        ctx.tree_mut().update_status(self.mailbox, |status| {
            for (item, value) in items {
                status.apply(*item, *value);
            }
        });
        Handled::Step(TaskStep::Continue)
    }

    fn handle_state(
        &mut self,
        _ctx: &mut TaskContext<'_>,
        handle: &CommandHandle,
        state: &State,
    ) -> Handled {
        if self.tag.as_ref() != Some(handle) {
            return Handled::NotMine;
        }
        self.tag = None;
        let step = match (state.status, self.messages) {
            (ResponseStatus::Ok, Some(count)) => TaskStep::Completed(TaskOutput::MessageCount(count)),
            (ResponseStatus::Ok, None) => TaskStep::Failed(TaskError::Protocol(
                "STATUS completed without a MESSAGES item".to_string(),
            )),
            (status, _) => TaskStep::Failed(TaskError::rejected(status, &state.text)),
        };
        Handled::Step(step)
    }
}
