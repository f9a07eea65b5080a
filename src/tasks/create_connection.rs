//! Connection bootstrap: greeting, authentication and capability discovery.
//!
//! Every other task on a connection depends on this one, directly or through a
//! chain of prerequisites. It completes once the session is authenticated.
//!
//! The mechanism is chosen from the server's capabilities. When the greeting does not
//! carry them, `CAPABILITY` is asked first so that `AUTH=PLAIN`, `SASL-IR` and
//! `LOGINDISABLED` are known before any credentials are sent.

use crate::config::{AuthMechanism, Credentials};
use crate::imap::{
    Command, CommandHandle, ImapCapability, Response, ResponseCode, ResponseStatus, State,
    UntaggedData,
};
use crate::tasks::{Handled, ImapTask, TaskContext, TaskError, TaskOutput, TaskStep};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingGreeting,
    /// Capabilities requested before authenticating
    Discovering,
    Authenticating,
    FetchingCapabilities,
    Ready,
    LoggingOut,
}

#[derive(Debug)]
pub struct CreateConnectionTask {
    credentials: Credentials,
    phase: Phase,
    login: Option<CommandHandle>,
    capability: Option<CommandHandle>,
}

impl CreateConnectionTask {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            phase: Phase::AwaitingGreeting,
            login: None,
            capability: None,
        }
    }

    fn authenticate(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep {
        let username = self.credentials.username.clone();
        let password = self.credentials.password.clone();
        let sasl_ir = ctx.has_capability(&ImapCapability::AuthPlain)
            && ctx.has_capability(&ImapCapability::SaslIr);

        let command = match self.credentials.mechanism {
            AuthMechanism::Plain if sasl_ir => Command::AuthenticatePlain { username, password },
            AuthMechanism::Plain => {
                warn!("Server does not advertise AUTH=PLAIN with SASL-IR, falling back to LOGIN");
                Command::Login { username, password }
            }
            AuthMechanism::Login => Command::Login { username, password },
        };

        if matches!(command, Command::Login { .. })
            && ctx.has_capability(&ImapCapability::LoginDisabled)
        {
            return TaskStep::Failed(TaskError::Protocol(
                "server advertises LOGINDISABLED".to_string(),
            ));
        }

        match ctx.send(command) {
            Ok(handle) => {
                self.login = Some(handle);
                self.phase = Phase::Authenticating;
                TaskStep::Continue
            }
            Err(e) => TaskStep::Failed(e),
        }
    }

    fn request_capabilities(&mut self, ctx: &mut TaskContext<'_>, next: Phase) -> TaskStep {
        match ctx.send(Command::Capability) {
            Ok(handle) => {
                self.capability = Some(handle);
                self.phase = next;
                TaskStep::Continue
            }
            Err(e) => TaskStep::Failed(e),
        }
    }

    fn finish(&mut self, ctx: &TaskContext<'_>) -> TaskStep {
        self.phase = Phase::Ready;
        info!(
            connection = %ctx.connection(),
            "Session ready ({} capabilities)",
            ctx.capabilities().len()
        );
        TaskStep::Completed(TaskOutput::Connected {
            capabilities: ctx.capabilities().to_vec(),
        })
    }

    fn greeting(&mut self, ctx: &mut TaskContext<'_>, state: &State) -> TaskStep {
        ctx.mark_greeted();
        if let Some(ResponseCode::Capability(capabilities)) = &state.code {
            ctx.set_capabilities(capabilities.clone());
        }
        match state.status {
            ResponseStatus::Preauth => {
                debug!("Server greeted with PREAUTH");
                self.finish(ctx)
            }
            ResponseStatus::Ok if ctx.capabilities().is_empty() => {
                debug!("Greeting without capabilities, asking before authenticating");
                self.request_capabilities(ctx, Phase::Discovering)
            }
            ResponseStatus::Ok => self.authenticate(ctx),
            ResponseStatus::Bye => TaskStep::Failed(TaskError::rejected(state.status, &state.text)),
            status => TaskStep::Failed(TaskError::Protocol(format!(
                "unexpected greeting: {} {}",
                status, state.text
            ))),
        }
    }
}

impl ImapTask for CreateConnectionTask {
    fn describe(&self) -> String {
        format!("Connecting as {}", self.credentials.username)
    }

    fn perform(&mut self, ctx: &mut TaskContext<'_>) -> TaskStep {
        debug!(connection = %ctx.connection(), "Waiting for server greeting");
        TaskStep::Continue
    }

    fn handle_untagged(&mut self, ctx: &mut TaskContext<'_>, response: &Response) -> Handled {
        match response {
            Response::State(state) if self.phase == Phase::AwaitingGreeting => {
                Handled::Step(self.greeting(ctx, state))
            }
            Response::Data(UntaggedData::Capability(capabilities)) => {
                ctx.set_capabilities(capabilities.clone());
                Handled::Step(TaskStep::Continue)
            }
            _ => Handled::NotMine,
        }
    }

    fn handle_state(
        &mut self,
        ctx: &mut TaskContext<'_>,
        handle: &CommandHandle,
        state: &State,
    ) -> Handled {
        if self.login.as_ref() == Some(handle) {
            self.login = None;
            if state.status != ResponseStatus::Ok {
                return Handled::Step(TaskStep::Failed(TaskError::rejected(
                    state.status,
                    &state.text,
                )));
            }
            // capabilities usually change after authentication
            if let Some(ResponseCode::Capability(capabilities)) = &state.code {
                ctx.set_capabilities(capabilities.clone());
                return Handled::Step(self.finish(ctx));
            }
            return Handled::Step(self.request_capabilities(ctx, Phase::FetchingCapabilities));
        }

        if self.capability.as_ref() == Some(handle) {
            self.capability = None;
            if state.status != ResponseStatus::Ok {
                return Handled::Step(TaskStep::Failed(TaskError::rejected(
                    state.status,
                    &state.text,
                )));
            }
            return Handled::Step(match self.phase {
                Phase::Discovering => self.authenticate(ctx),
                _ => self.finish(ctx),
            });
        }

        Handled::NotMine
    }

    fn cancel(&mut self, ctx: &mut TaskContext<'_>) {
        if ctx.greeted() && self.phase != Phase::LoggingOut {
            match ctx.send(Command::Logout) {
                Ok(_) => self.phase = Phase::LoggingOut,
                Err(e) => warn!("Failed to queue LOGOUT: {}", e),
            }
        }
        ctx.request_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::CommandHandle;
    use crate::model::{ConnectionId, ConnectionLink, MailboxTree};
    use crate::tasks::TaskId;
    use std::sync::Arc;

    fn greeting(status: ResponseStatus, code: Option<ResponseCode>) -> Response {
        Response::State(State {
            tag: None,
            status,
            code,
            text: "hello".to_string(),
        })
    }

    fn tagged(tag: &str, status: ResponseStatus, code: Option<ResponseCode>) -> State {
        State {
            tag: Some(CommandHandle::from_wire(tag)),
            status,
            code,
            text: "done".to_string(),
        }
    }

    fn sent(link: &mut ConnectionLink) -> Vec<String> {
        link.drain_outbound()
            .into_iter()
            .map(|c| String::from_utf8(c.bytes).unwrap())
            .collect()
    }

    fn capability_data(capabilities: Vec<ImapCapability>) -> Response {
        Response::Data(UntaggedData::Capability(capabilities))
    }

    #[test]
    fn test_login_then_capability() {
        let mut link = ConnectionLink::new(ConnectionId(1));
        let mut tree = Arc::new(MailboxTree::new());
        let mut task = CreateConnectionTask::new(Credentials::new("alice", "pw"));

        let mut ctx = TaskContext::new(TaskId(1), &mut link, &mut tree);
        assert_eq!(task.perform(&mut ctx), TaskStep::Continue);
        let code = ResponseCode::Capability(vec![ImapCapability::Imap4Rev1]);
        let step = task.handle_untagged(&mut ctx, &greeting(ResponseStatus::Ok, Some(code)));
        assert_eq!(step, Handled::Step(TaskStep::Continue));
        drop(ctx);
        assert_eq!(sent(&mut link), vec!["A1 LOGIN alice pw\r\n"]);

        let mut ctx = TaskContext::new(TaskId(1), &mut link, &mut tree);
        let handle = CommandHandle::from_wire("A1");
        let step = task.handle_state(&mut ctx, &handle, &tagged("A1", ResponseStatus::Ok, None));
        assert_eq!(step, Handled::Step(TaskStep::Continue));
        task.handle_untagged(&mut ctx, &capability_data(vec![ImapCapability::Idle]));
        let handle = CommandHandle::from_wire("A2");
        let step = task.handle_state(&mut ctx, &handle, &tagged("A2", ResponseStatus::Ok, None));
        assert_eq!(
            step,
            Handled::Step(TaskStep::Completed(TaskOutput::Connected {
                capabilities: vec![ImapCapability::Idle]
            }))
        );
        drop(ctx);
        assert_eq!(sent(&mut link), vec!["A2 CAPABILITY\r\n"]);
    }

    #[test]
    fn test_bare_greeting_asks_capabilities_before_plain() {
        let mut link = ConnectionLink::new(ConnectionId(1));
        let mut tree = Arc::new(MailboxTree::new());
        let credentials = Credentials::new("user", "pass").with_mechanism(AuthMechanism::Plain);
        let mut task = CreateConnectionTask::new(credentials);

        let mut ctx = TaskContext::new(TaskId(1), &mut link, &mut tree);
        let step = task.handle_untagged(&mut ctx, &greeting(ResponseStatus::Ok, None));
        assert_eq!(step, Handled::Step(TaskStep::Continue));
        drop(ctx);
        assert_eq!(sent(&mut link), vec!["A1 CAPABILITY\r\n"]);

        let mut ctx = TaskContext::new(TaskId(1), &mut link, &mut tree);
        task.handle_untagged(
            &mut ctx,
            &capability_data(vec![
                ImapCapability::Imap4Rev1,
                ImapCapability::SaslIr,
                ImapCapability::AuthPlain,
            ]),
        );
        let handle = CommandHandle::from_wire("A1");
        let step = task.handle_state(&mut ctx, &handle, &tagged("A1", ResponseStatus::Ok, None));
        assert_eq!(step, Handled::Step(TaskStep::Continue));
        drop(ctx);
        assert_eq!(sent(&mut link), vec!["A2 AUTHENTICATE PLAIN AHVzZXIAcGFzcw==\r\n"]);
    }

    #[test]
    fn test_login_disabled_learned_after_greeting_fails() {
        let mut link = ConnectionLink::new(ConnectionId(1));
        let mut tree = Arc::new(MailboxTree::new());
        let mut task = CreateConnectionTask::new(Credentials::new("u", "p"));

        let mut ctx = TaskContext::new(TaskId(1), &mut link, &mut tree);
        task.handle_untagged(&mut ctx, &greeting(ResponseStatus::Ok, None));
        task.handle_untagged(
            &mut ctx,
            &capability_data(vec![ImapCapability::Imap4Rev1, ImapCapability::LoginDisabled]),
        );
        let handle = CommandHandle::from_wire("A1");
        let step = task.handle_state(&mut ctx, &handle, &tagged("A1", ResponseStatus::Ok, None));
        assert!(matches!(
            step,
            Handled::Step(TaskStep::Failed(TaskError::Protocol(_)))
        ));
        drop(ctx);
        assert_eq!(sent(&mut link), vec!["A1 CAPABILITY\r\n"]);
    }

    #[test]
    fn test_plain_with_sasl_ir() {
        let mut link = ConnectionLink::new(ConnectionId(1));
        let mut tree = Arc::new(MailboxTree::new());
        let credentials = Credentials::new("user", "pass").with_mechanism(AuthMechanism::Plain);
        let mut task = CreateConnectionTask::new(credentials);

        let mut ctx = TaskContext::new(TaskId(1), &mut link, &mut tree);
        let code = ResponseCode::Capability(vec![
            ImapCapability::Imap4Rev1,
            ImapCapability::SaslIr,
            ImapCapability::AuthPlain,
        ]);
        task.handle_untagged(&mut ctx, &greeting(ResponseStatus::Ok, Some(code)));
        drop(ctx);
        assert_eq!(sent(&mut link), vec!["A1 AUTHENTICATE PLAIN AHVzZXIAcGFzcw==\r\n"]);
    }

    #[test]
    fn test_login_disabled_fails() {
        let mut link = ConnectionLink::new(ConnectionId(1));
        let mut tree = Arc::new(MailboxTree::new());
        let mut task = CreateConnectionTask::new(Credentials::new("u", "p"));

        let mut ctx = TaskContext::new(TaskId(1), &mut link, &mut tree);
        let code = ResponseCode::Capability(vec![ImapCapability::LoginDisabled]);
        let step = task.handle_untagged(&mut ctx, &greeting(ResponseStatus::Ok, Some(code)));
        assert!(matches!(
            step,
            Handled::Step(TaskStep::Failed(TaskError::Protocol(_)))
        ));
    }

    #[test]
    fn test_rejected_login() {
        let mut link = ConnectionLink::new(ConnectionId(1));
        let mut tree = Arc::new(MailboxTree::new());
        let mut task = CreateConnectionTask::new(Credentials::new("u", "p"));

        let mut ctx = TaskContext::new(TaskId(1), &mut link, &mut tree);
        let code = ResponseCode::Capability(vec![ImapCapability::Imap4Rev1]);
        task.handle_untagged(&mut ctx, &greeting(ResponseStatus::Ok, Some(code)));
        let handle = CommandHandle::from_wire("A1");
        let step = task.handle_state(&mut ctx, &handle, &tagged("A1", ResponseStatus::No, None));
        assert_eq!(
            step,
            Handled::Step(TaskStep::Failed(TaskError::rejected(ResponseStatus::No, "done")))
        );
    }

    #[test]
    fn test_cancel_before_greeting_sends_nothing() {
        let mut link = ConnectionLink::new(ConnectionId(1));
        let mut tree = Arc::new(MailboxTree::new());
        let mut task = CreateConnectionTask::new(Credentials::new("u", "p"));

        let mut ctx = TaskContext::new(TaskId(1), &mut link, &mut tree);
        task.cancel(&mut ctx);
        let effects = ctx.finish();
        assert!(effects.close_requested);
        assert!(effects.issued.is_empty());
    }
}
