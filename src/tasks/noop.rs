use crate::imap::{Command, CommandHandle, Response, ResponseStatus, State, UntaggedData};
use crate::tasks::{Handled, ImapTask, TaskContext, TaskError, TaskOutput, TaskStep};

/// `NOOP`, used as keep-alive; folds unsolicited size updates into the selected mailbox
#[derive(Debug, Default)]
pub struct NoopTask {
    tag: Option<CommandHandle>,
}

impl NoopTask {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImapTask for NoopTask {
    fn describe(&self) -> String {
        "Keeping connection alive".to_string()
    }

    fn perform(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep {
        match ctx.send(Command::Noop) {
            Ok(handle) => {
                self.tag = Some(handle);
                TaskStep::Continue
            }
            Err(e) => TaskStep::Failed(e),
        }
    }

    fn handle_untagged(&mut self, ctx: &mut TaskContext<'_>, response: &Response) -> Handled {
        let (Some(_), Some(selected)) = (self.tag.as_ref(), ctx.selected()) else {
            return Handled::NotMine;
        };
        // size data during a SELECT describes the mailbox being opened
        if ctx.pending_select().is_some() {
            return Handled::NotMine;
        }
        let Response::Data(data) = response else {
            return Handled::NotMine;
        };
        let applied = match data {
            UntaggedData::Exists(n) => ctx
                .tree_mut()
                .update_status(selected, |status| status.messages = Some(*n)),
            UntaggedData::Recent(n) => ctx
                .tree_mut()
                .update_status(selected, |status| status.recent = Some(*n)),
            UntaggedData::Expunge(_) => ctx.tree_mut().update_status(selected, |status| {
                status.messages = status.messages.map(|m| m.saturating_sub(1));
            }),
            _ => return Handled::NotMine,
        };
        if applied {
            Handled::Step(TaskStep::Continue)
        } else {
            Handled::NotMine
        }
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
        Handled::Step(match state.status {
            ResponseStatus::Ok => TaskStep::Completed(TaskOutput::Noop),
            status => TaskStep::Failed(TaskError::rejected(status, &state.text)),
        })
    }
}
