use crate::imap::{
    same_mailbox, Command, CommandHandle, FolderAttribute, Response, ResponseStatus, State,
    UntaggedData,
};
use crate::model::MailboxRef;
use crate::tasks::{Handled, ImapTask, TaskContext, TaskError, TaskOutput, TaskStep};
use tracing::debug;

#[derive(Debug, Clone)]
struct Listed {
    path: String,
    delimiter: Option<String>,
    attributes: Vec<FolderAttribute>,
}

/// `LIST "" "<parent><delimiter>%"`, reconciled into the tree on completion
#[derive(Debug)]
pub struct ListChildMailboxesTask {
    parent: MailboxRef,
    label: String,
    /// Path prefix of direct children; empty at the top level
    prefix: Option<String>,
    tag: Option<CommandHandle>,
    listed: Vec<Listed>,
}

impl ListChildMailboxesTask {
    pub fn new(parent: MailboxRef, label: String) -> Self {
        Self {
            parent,
            label,
            prefix: None,
            tag: None,
            listed: Vec::new(),
        }
    }

    /// Direct child of the listed parent, as opposed to the parent itself or a deeper descendant
    fn is_direct_child(&self, mailbox: &str, delimiter: Option<&str>) -> bool {
        let Some(prefix) = self.prefix.as_deref() else {
            return false;
        };
        let Some(rest) = mailbox.strip_prefix(prefix) else {
            return false;
        };
        if rest.is_empty() {
            return false;
        }
        match delimiter {
            Some(delimiter) => !rest.contains(delimiter),
            None => true,
        }
    }
}

fn leaf_name(path: &str, delimiter: Option<&str>) -> String {
    match delimiter {
        Some(delimiter) if !delimiter.is_empty() => {
            path.rsplit(delimiter).next().unwrap_or(path).to_string()
        }
        _ => path.to_string(),
    }
}

impl ImapTask for ListChildMailboxesTask {
    fn describe(&self) -> String {
        format!("Listing mailboxes under {}", self.label)
    }

    fn target(&self) -> Option<MailboxRef> {
        Some(self.parent)
    }

    fn perform(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep {
        let Some(node) = ctx.resolve(self.parent) else {
            return TaskStep::Failed(TaskError::TargetInvalidated);
        };
        let prefix = if node.is_root() {
            String::new()
        } else {
            format!("{}{}", node.path(), ctx.delimiter_for(self.parent))
        };
        let command = Command::List {
            reference: String::new(),
            pattern: format!("{}%", prefix),
        };
        match ctx.send(command) {
            Ok(handle) => {
                self.tag = Some(handle);
                self.prefix = Some(prefix);
                TaskStep::Continue
            }
            Err(e) => TaskStep::Failed(e),
        }
    }

    fn handle_untagged(&mut self, _ctx: &mut TaskContext<'_>, response: &Response) -> Handled {
        let Response::Data(UntaggedData::List {
            attributes,
            delimiter,
            mailbox,
        }) = response
        else {
            return Handled::NotMine;
        };
        if self.tag.is_none() || !self.is_direct_child(mailbox, delimiter.as_deref()) {
            return Handled::NotMine;
        }
        if attributes.contains(&FolderAttribute::NonExistent) {
            return Handled::Step(TaskStep::Continue);
        }
        self.listed.push(Listed {
            path: mailbox.clone(),
            delimiter: delimiter.clone(),
            attributes: attributes.clone(),
        });
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

        let parent = self.parent;
        let listed = std::mem::take(&mut self.listed);
        let tree = ctx.tree_mut();
        if !tree.is_valid(parent) {
            return Handled::Step(TaskStep::Failed(TaskError::TargetInvalidated));
        }

        let previous = tree.children(parent);
        let mut children = Vec::with_capacity(listed.len());
        for entry in listed {
            if let Some(delimiter) = entry.delimiter.as_deref() {
                tree.set_delimiter(delimiter);
            }
            let name = leaf_name(&entry.path, entry.delimiter.as_deref());
            if let Some(child) =
                tree.insert_child(parent, &name, &entry.path, entry.delimiter, entry.attributes)
            {
                children.push(child);
            }
        }
        for stale in previous.into_iter().filter(|c| !children.contains(c)) {
            let keep_inbox = tree
                .resolve(stale)
                .map_or(false, |node| same_mailbox(node.path(), "INBOX"))
                && tree.resolve(parent).map_or(false, |node| node.is_root());
            if keep_inbox {
                continue;
            }
            debug!("Mailbox {:?} disappeared from the server", tree.resolve(stale).map(|n| n.path()));
            tree.remove(stale);
        }
        tree.set_children_loaded(parent);

        Handled::Step(TaskStep::Completed(TaskOutput::Mailboxes(children)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_name() {
        assert_eq!(leaf_name("Work/Budget/2024", Some("/")), "2024");
        assert_eq!(leaf_name("INBOX.Sent", Some(".")), "Sent");
        assert_eq!(leaf_name("Flat", None), "Flat");
    }

    #[test]
    fn test_direct_child_filter() {
        let mut task = ListChildMailboxesTask::new(
            crate::model::MailboxTree::new().root(),
            "Work".to_string(),
        );
        task.prefix = Some("Work/".to_string());
        assert!(task.is_direct_child("Work/Budget", Some("/")));
        assert!(!task.is_direct_child("Work/Budget/2024", Some("/")));
        assert!(!task.is_direct_child("Work/", Some("/")));
        assert!(!task.is_direct_child("Personal", Some("/")));

        task.prefix = Some(String::new());
        assert!(task.is_direct_child("INBOX", Some("/")));
        assert!(!task.is_direct_child("Work/Budget", Some("/")));
    }
}
