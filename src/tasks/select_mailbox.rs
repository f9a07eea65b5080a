use crate::imap::{
    Command, CommandHandle, Response, ResponseCode, ResponseStatus, State, UntaggedData,
};
use crate::model::{MailboxRef, MailboxStatus};
use crate::tasks::{Handled, ImapTask, TaskContext, TaskError, TaskOutput, TaskStep};

/// `SELECT` or `EXAMINE`
#[derive(Debug)]
pub struct SelectMailboxTask {
    mailbox: MailboxRef,
    label: String,
    read_only: bool,
    tag: Option<CommandHandle>,
    status: MailboxStatus,
}

impl SelectMailboxTask {
    pub fn new(mailbox: MailboxRef, label: String, read_only: bool) -> Self {
        Self {
            mailbox,
            label,
            read_only,
            tag: None,
            status: MailboxStatus::default(),
        }
    }
}

impl ImapTask for SelectMailboxTask {
    fn describe(&self) -> String {
        let verb = if self.read_only { "Examining" } else { "Opening" };
        format!("{} {}", verb, self.label)
    }

    fn target(&self) -> Option<MailboxRef> {
        Some(self.mailbox)
    }

    fn perform(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep {
        let Some(node) = ctx.resolve(self.mailbox) else {
            return TaskStep::Failed(TaskError::TargetInvalidated);
        };
        if !node.is_selectable() {
            return TaskStep::Failed(TaskError::Protocol(format!(
                "{} cannot be selected",
                node.path()
            )));
        }
        let mailbox = node.path().to_string();
        let command = if self.read_only {
            Command::Examine { mailbox }
        } else {
            Command::Select { mailbox }
        };
        // the previous selection ends as soon as SELECT is sent
        ctx.set_selected(None);
        match ctx.send(command) {
            Ok(handle) => {
                self.tag = Some(handle);
                TaskStep::Continue
            }
            Err(e) => TaskStep::Failed(e),
        }
    }

    fn handle_untagged(&mut self, ctx: &mut TaskContext<'_>, response: &Response) -> Handled {
        // with several selects in flight only the oldest one is being answered
        if self.tag.is_none() || ctx.pending_select() != self.tag.as_ref() {
            return Handled::NotMine;
        }
        match response {
            Response::Data(UntaggedData::Exists(n)) => self.status.messages = Some(*n),
            Response::Data(UntaggedData::Recent(n)) => self.status.recent = Some(*n),
            Response::Data(UntaggedData::Flags(_)) => {}
            Response::State(state) if state.status == ResponseStatus::Ok => match &state.code {
                Some(ResponseCode::UidNext(n)) => self.status.uid_next = Some(*n),
                Some(ResponseCode::UidValidity(n)) => self.status.uid_validity = Some(*n),
                Some(ResponseCode::Unseen(n)) => self.status.first_unseen = Some(*n),
                Some(_) => {}
                None => return Handled::NotMine,
            },
            _ => return Handled::NotMine,
        }
        Handled::Step(TaskStep::Continue)
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
        let status = self.status.clone();
        ctx.tree_mut()
            .update_status(self.mailbox, |current| current.merge(&status));
        ctx.set_selected(Some(self.mailbox));
        Handled::Step(TaskStep::Completed(TaskOutput::Selected(status)))
    }
}
