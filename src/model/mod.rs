//! The task manager.
//!
//! [`Model`] owns the task pool, the connection links and the mailbox tree. It creates
//! tasks and their connection bootstraps, moves tasks through their lifecycle, routes
//! decoded responses to the tasks that asked for them and fails whatever a dropped
//! connection or a removed mailbox leaves behind. It performs no I/O: the engine feeds
//! it responses and drains the commands it queues.

pub mod activity;
pub mod link;
pub mod pool;
pub mod tree;

pub use activity::{
    ActivitySnapshot, Diagnostics, Observers, TaskEvent, TaskSummary, UnroutedReason,
    UnroutedResponse,
};
pub use link::{ConnectionId, ConnectionLink, LinkStatus, OutboundCommand};
pub use pool::{TaskEntry, TaskPool};
pub use tree::{MailboxNode, MailboxRef, MailboxStatus, MailboxTree};

use crate::config::Credentials;
use crate::imap::{Command, DecodeError, ImapError, ImapResult, Response, ResponseStatus, State};
use crate::tasks::{
    CreateConnectionTask, Handled, ImapTask, TaskContext, TaskError, TaskId, TaskKind,
    TaskOutcome, TaskOutput, TaskRequest, TaskState, TaskStep,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Outcomes kept after their task was reaped
const FINISHED_HISTORY: usize = 256;

/// What is remembered of a task once it reached a terminal state
#[derive(Debug, Clone)]
struct FinishedTask {
    connection: ConnectionId,
    outcome: TaskOutcome,
}

/// Where a response ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Tagged response handed to its owner
    Delivered { task: TaskId },
    /// Tagged response for a task that had already finished; recorded in diagnostics
    Consumed { task: TaskId },
    /// Untagged response offered to every live task; `claimed` accepted it
    Broadcast { claimed: usize },
    Unrouted,
}

pub struct Model {
    pool: TaskPool,
    links: BTreeMap<ConnectionId, ConnectionLink>,
    current: Option<ConnectionId>,
    next_connection: u64,
    tree: Arc<MailboxTree>,
    tree_dirty: bool,
    credentials: Credentials,
    finished: BTreeMap<TaskId, FinishedTask>,
    diagnostics: Diagnostics,
    observers: Observers,
}

impl Model {
    pub fn new(credentials: Credentials) -> Self {
        let tree = Arc::new(MailboxTree::new());
        Self {
            pool: TaskPool::new(),
            links: BTreeMap::new(),
            current: None,
            next_connection: 0,
            observers: Observers::new(Arc::clone(&tree)),
            tree,
            tree_dirty: false,
            credentials,
            finished: BTreeMap::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    // ---- requests ----

    /// Bootstrap of the current connection, creating connection and bootstrap if needed
    pub fn connect(&mut self) -> TaskId {
        let (_, bootstrap) = self.ensure_bootstrap();
        self.settle();
        bootstrap
    }

    /// Create a task that runs once the connection is authenticated
    pub fn submit(&mut self, request: TaskRequest) -> ImapResult<TaskId> {
        let (connection, bootstrap) = self.ensure_bootstrap();
        let task = request.into_task(&self.tree);
        let id = self.create_task(task, connection, Some(bootstrap))?;
        self.settle();
        Ok(id)
    }

    /// Create a task that runs after `prerequisite` completed, on the same connection
    ///
    /// A prerequisite that already finished (even one reaped from the pool) is looked up
    /// in the outcome history. If it completed on a connection that is no longer usable,
    /// the new task runs on the current connection instead.
    pub fn submit_after(&mut self, request: TaskRequest, prerequisite: TaskId) -> ImapResult<TaskId> {
        let connection = self
            .pool
            .get(prerequisite)
            .map(|entry| entry.connection)
            .or_else(|| self.finished.get(&prerequisite).map(|f| f.connection))
            .ok_or_else(|| {
                ImapError::invalid_state(format!("prerequisite task {} is unknown", prerequisite))
            })?;
        let link_usable = self
            .links
            .get(&connection)
            .map_or(false, |link| link.is_usable());
        let completed = self.task_state(prerequisite) == Some(TaskState::Completed);

        let task = request.into_task(&self.tree);
        let id = if completed && !link_usable {
            let (connection, bootstrap) = self.ensure_bootstrap();
            debug!(task = %prerequisite, %connection, "Prerequisite's connection is gone, using the current one");
            self.create_task(task, connection, Some(bootstrap))?
        } else {
            self.create_task(task, connection, Some(prerequisite))?
        };
        self.settle();
        Ok(id)
    }

    /// Cancel a task and everything waiting on it
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let cancelled = self.cancel_inner(id);
        self.settle();
        cancelled
    }

    /// Cancel all work and log out of every connection
    pub fn shutdown(&mut self) {
        let live: Vec<TaskId> = self
            .pool
            .iter()
            .rev()
            .filter(|entry| !entry.state.is_terminal())
            .map(|entry| entry.id)
            .collect();
        for id in live {
            self.cancel_inner(id);
        }

        let idle: Vec<(ConnectionId, TaskId)> = self
            .links
            .values()
            .filter(|link| link.is_usable() && link.greeted)
            .filter_map(|link| link.bootstrap.map(|b| (link.id(), b)))
            .collect();
        for (connection, bootstrap) in idle {
            if let Some(link) = self.links.get_mut(&connection) {
                match link.queue(&Command::Logout) {
                    Ok(handle) => self.pool.register_handle(connection, handle, bootstrap),
                    Err(e) => warn!(%connection, "Failed to queue LOGOUT: {}", e),
                }
            }
            self.retire_link(connection);
        }
        self.settle();
    }

    // ---- inbound ----

    pub fn on_transport_opened(&mut self, connection: ConnectionId) {
        if let Some(link) = self.links.get_mut(&connection) {
            if link.status == LinkStatus::Connecting {
                link.status = LinkStatus::Open;
            }
            info!(%connection, "Transport open");
        }
    }

    /// Route one decoded response
    pub fn on_response(&mut self, connection: ConnectionId, response: Response) -> Dispatch {
        let dispatch = match response {
            Response::State(state) if state.tag.is_some() => self.dispatch_tagged(connection, state),
            other => self.dispatch_untagged(connection, &other),
        };
        self.settle();
        dispatch
    }

    pub fn on_decode_error(&mut self, connection: ConnectionId, error: &DecodeError) {
        self.diagnostics.decode_errors += 1;
        warn!(%connection, "{}", error);
    }

    /// Fail everything that was running on a dropped connection
    pub fn on_connection_lost(&mut self, connection: ConnectionId, reason: &str) {
        let Some(link) = self.links.get_mut(&connection) else {
            return;
        };
        link.status = LinkStatus::Lost;
        if self.current == Some(connection) {
            self.current = None;
        }

        let mut victims = self.pool.live_on(connection);
        if !victims.is_empty() {
            warn!(%connection, "Connection lost with {} live tasks: {}", victims.len(), reason);
        } else {
            info!(%connection, "Connection closed: {}", reason);
        }
        // dependents fail before their prerequisites
        victims.sort_by_key(|id| (std::cmp::Reverse(self.pool.depth(*id)), *id));
        for id in victims {
            self.fail(id, TaskError::ConnectionLost(reason.to_string()));
        }

        let dropped = self.pool.reclaim_connection(connection);
        if dropped > 0 {
            debug!(%connection, "Dropped {} unanswered handles", dropped);
        }
        self.links.remove(&connection);
        self.settle();
    }

    // ---- engine-facing ----

    /// Connections whose transport should be opened now
    pub fn take_transport_requests(&mut self) -> Vec<ConnectionId> {
        self.links
            .values_mut()
            .filter(|link| link.status == LinkStatus::Connecting)
            .filter_map(|link| link.take_transport_request().then_some(link.id()))
            .collect()
    }

    pub fn take_outbound(&mut self, connection: ConnectionId) -> Vec<OutboundCommand> {
        self.links
            .get_mut(&connection)
            .map(|link| link.drain_outbound())
            .unwrap_or_default()
    }

    /// Links waiting for their transport to be closed
    pub fn closing_links(&self) -> Vec<ConnectionId> {
        self.links
            .values()
            .filter(|link| link.status == LinkStatus::Closing)
            .map(|link| link.id())
            .collect()
    }

    pub fn link_status(&self, connection: ConnectionId) -> Option<LinkStatus> {
        self.links.get(&connection).map(|link| link.status())
    }

    pub fn current_connection(&self) -> Option<ConnectionId> {
        self.current
    }

    pub fn bootstrap_of(&self, connection: ConnectionId) -> Option<TaskId> {
        self.links.get(&connection).and_then(|link| link.bootstrap)
    }

    /// Current connection is authenticated and has nothing to do
    pub fn has_idle_link(&self) -> bool {
        let Some(link) = self.current.and_then(|c| self.links.get(&c)) else {
            return false;
        };
        let authenticated = link
            .bootstrap
            .and_then(|b| self.pool.state(b))
            .map_or(false, |state| *state == TaskState::Completed);
        link.status == LinkStatus::Open
            && authenticated
            && self.pool.live_on(link.id()).is_empty()
    }

    // ---- queries ----

    pub fn tree(&self) -> &MailboxTree {
        &self.tree
    }

    pub fn tree_snapshot(&self) -> Arc<MailboxTree> {
        Arc::clone(&self.tree)
    }

    pub fn lookup(&self, path: &str) -> Option<MailboxRef> {
        self.tree.find(path)
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        if let Some(state) = self.pool.state(id) {
            return Some(state.clone());
        }
        self.finished.get(&id).map(|finished| match &finished.outcome {
            Ok(_) => TaskState::Completed,
            Err(error) => TaskState::Failed(error.clone()),
        })
    }

    pub fn outcome(&self, id: TaskId) -> Option<&TaskOutcome> {
        self.finished.get(&id).map(|finished| &finished.outcome)
    }

    /// Channel resolved with the task's outcome; immediately resolved for finished tasks
    pub fn watch_task(&mut self, id: TaskId) -> Option<oneshot::Receiver<TaskOutcome>> {
        let (tx, rx) = oneshot::channel();
        if let Some(entry) = self.pool.get_mut(id) {
            if !entry.state.is_terminal() {
                entry.waiters.push(tx);
                return Some(rx);
            }
        }
        let outcome = self.finished.get(&id)?.outcome.clone();
        let _ = tx.send(outcome);
        Some(rx)
    }

    pub fn activity(&self) -> ActivitySnapshot {
        let tasks: Vec<TaskSummary> = self
            .pool
            .iter()
            .filter(|entry| !entry.state.is_terminal())
            .map(|entry| TaskSummary {
                id: entry.id,
                description: entry.description.clone(),
                state: entry.state.clone(),
                connection: entry.connection,
            })
            .collect();
        ActivitySnapshot {
            active: tasks.len(),
            tasks,
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Tasks still held by the pool, finished or not
    pub fn task_count(&self) -> usize {
        self.pool.len()
    }

    pub fn outstanding_handles(&self) -> usize {
        self.pool.handle_count()
    }

    pub fn subscribe_activity(&self) -> watch::Receiver<ActivitySnapshot> {
        self.observers.subscribe_activity()
    }

    pub fn subscribe_tree(&self) -> watch::Receiver<Arc<MailboxTree>> {
        self.observers.subscribe_tree()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.observers.subscribe_events()
    }

    pub fn event_sender(&self) -> broadcast::Sender<TaskEvent> {
        self.observers.event_sender()
    }

    // ---- internals ----

    fn ensure_bootstrap(&mut self) -> (ConnectionId, TaskId) {
        if let Some(connection) = self.current {
            let reusable = self
                .links
                .get(&connection)
                .filter(|link| link.is_usable())
                .and_then(|link| link.bootstrap)
                .filter(|b| {
                    self.pool
                        .state(*b)
                        .map_or(false, |state| !matches!(state, TaskState::Failed(_)))
                });
            if let Some(bootstrap) = reusable {
                return (connection, bootstrap);
            }
        }

        self.next_connection += 1;
        let connection = ConnectionId(self.next_connection);
        let id = self.pool.allocate_id();
        let task = TaskKind::CreateConnection(CreateConnectionTask::new(self.credentials.clone()));
        let mut link = ConnectionLink::new(connection);
        link.bootstrap = Some(id);
        self.links.insert(connection, link);
        self.current = Some(connection);
        self.pool.insert(TaskEntry::new(id, task, connection, None));
        info!(%connection, task = %id, "New connection, bootstrap task created");
        self.emit(id);
        self.transition(id, TaskState::Queued);
        (connection, id)
    }

    fn create_task(
        &mut self,
        task: TaskKind,
        connection: ConnectionId,
        prerequisite: Option<TaskId>,
    ) -> ImapResult<TaskId> {
        let prerequisite_state = match prerequisite {
            Some(p) => Some(self.task_state(p).ok_or_else(|| {
                ImapError::invalid_state(format!("prerequisite task {} is unknown", p))
            })?),
            None => None,
        };

        let id = self.pool.allocate_id();
        self.pool.insert(TaskEntry::new(id, task, connection, prerequisite));
        if let Some(entry) = prerequisite.and_then(|p| self.pool.get_mut(p)) {
            entry.dependents.push(id);
        }
        debug!(task = %id, %connection, "Created task");
        self.emit(id);

        match (prerequisite, prerequisite_state) {
            (Some(p), Some(TaskState::Failed(error))) => self.fail(
                id,
                TaskError::DependencyFailed {
                    prerequisite: p,
                    reason: error.to_string(),
                },
            ),
            (Some(_), Some(TaskState::Completed)) | (None, _) => {
                self.transition(id, TaskState::Queued);
            }
            (Some(_), _) => {
                self.transition(id, TaskState::WaitingOnDependency);
            }
        }
        Ok(id)
    }

    fn transition(&mut self, id: TaskId, next: TaskState) -> bool {
        let Some(entry) = self.pool.get_mut(id) else {
            return false;
        };
        if !entry.state.can_transition_to(&next) {
            warn!(
                task = %id,
                from = entry.state.name(),
                to = next.name(),
                "Ignoring invalid task transition"
            );
            return false;
        }
        debug!(task = %id, from = entry.state.name(), to = next.name(), "{}", entry.description);
        entry.state = next;
        if entry.state == TaskState::Queued {
            self.pool.enqueue(id);
        }
        self.emit(id);
        self.observers.publish_activity(self.activity());
        true
    }

    fn emit(&self, id: TaskId) {
        if let Some(entry) = self.pool.get(id) {
            self.observers.emit(TaskEvent {
                id,
                description: entry.description.clone(),
                state: entry.state.clone(),
            });
        }
    }

    fn complete(&mut self, id: TaskId, output: TaskOutput) {
        if !self.transition(id, TaskState::Completed) {
            return;
        }
        self.resolve_waiters(id, Ok(output));
        let dependents = self
            .pool
            .get(id)
            .map(|entry| entry.dependents.clone())
            .unwrap_or_default();
        for dependent in dependents {
            if self.pool.state(dependent) == Some(&TaskState::WaitingOnDependency) {
                self.transition(dependent, TaskState::Queued);
            }
        }
    }

    fn fail(&mut self, id: TaskId, error: TaskError) {
        if !self.transition(id, TaskState::Failed(error.clone())) {
            return;
        }
        match &error {
            TaskError::Cancelled => info!(task = %id, "Task cancelled"),
            other => warn!(task = %id, "Task failed: {}", other),
        }
        self.resolve_waiters(id, Err(error.clone()));

        if let Some(connection) = self.pool.get(id).map(|entry| entry.connection) {
            if self.bootstrap_of(connection) == Some(id) {
                self.retire_link(connection);
            }
        }

        let dependents = self
            .pool
            .get(id)
            .map(|entry| entry.dependents.clone())
            .unwrap_or_default();
        for dependent in dependents {
            let waiting = matches!(
                self.pool.state(dependent),
                Some(TaskState::Unstarted) | Some(TaskState::WaitingOnDependency)
            );
            if waiting {
                self.fail(
                    dependent,
                    TaskError::DependencyFailed {
                        prerequisite: id,
                        reason: error.to_string(),
                    },
                );
            }
        }
    }

    fn cancel_inner(&mut self, id: TaskId) -> bool {
        let live = self
            .pool
            .state(id)
            .map_or(false, |state| !state.is_terminal());
        if !live {
            return false;
        }
        let dependents = self
            .pool
            .get(id)
            .map(|entry| entry.dependents.clone())
            .unwrap_or_default();
        for dependent in dependents {
            self.cancel_inner(dependent);
        }
        self.with_task(id, |task, ctx| task.cancel(ctx));
        self.fail(id, TaskError::Cancelled);
        true
    }

    fn resolve_waiters(&mut self, id: TaskId, outcome: TaskOutcome) {
        // waiters read the tree as soon as they wake
        if self.tree_dirty {
            self.observers.publish_tree(Arc::clone(&self.tree));
        }
        let Some(entry) = self.pool.get_mut(id) else {
            return;
        };
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        let connection = entry.connection;
        self.finished.insert(id, FinishedTask { connection, outcome });
        while self.finished.len() > FINISHED_HISTORY {
            self.finished.pop_first();
        }
    }

    fn retire_link(&mut self, connection: ConnectionId) {
        if let Some(link) = self.links.get_mut(&connection) {
            if link.is_usable() {
                link.status = LinkStatus::Closing;
                info!(%connection, "Connection retired");
            }
        }
        if self.current == Some(connection) {
            self.current = None;
        }
    }

    /// Lend a task its context for one callback and apply the collected effects
    fn with_task<R>(
        &mut self,
        id: TaskId,
        f: impl FnOnce(&mut TaskKind, &mut TaskContext<'_>) -> R,
    ) -> Option<R> {
        let entry = self.pool.get_mut(id)?;
        let connection = entry.connection;
        let link = self.links.get_mut(&connection)?;
        let mut ctx = TaskContext::new(id, link, &mut self.tree);
        let result = f(&mut entry.task, &mut ctx);
        let effects = ctx.finish();

        for handle in effects.issued {
            self.pool.register_handle(connection, handle, id);
        }
        if effects.tree_changed {
            self.tree_dirty = true;
        }
        if effects.close_requested {
            self.retire_link(connection);
        }
        Some(result)
    }

    fn apply_step(&mut self, id: TaskId, step: TaskStep) {
        match step {
            TaskStep::Continue => {}
            TaskStep::Completed(output) => self.complete(id, output),
            TaskStep::Failed(error) => self.fail(id, error),
        }
    }

    fn target_gone(&self, id: TaskId) -> bool {
        self.pool
            .get(id)
            .and_then(|entry| entry.task.target())
            .map_or(false, |target| !self.tree.is_valid(target))
    }

    /// Start queued tasks in FIFO order
    fn run_ready(&mut self) {
        while let Some(id) = self.pool.pop_ready() {
            if self.pool.state(id) != Some(&TaskState::Queued) {
                continue;
            }
            if !self.transition(id, TaskState::Running) {
                continue;
            }
            if self.target_gone(id) {
                self.fail(id, TaskError::TargetInvalidated);
                continue;
            }
            match self.with_task(id, |task, ctx| task.perform(ctx)) {
                Some(step) => self.apply_step(id, step),
                None => self.fail(id, TaskError::ConnectionLost("connection is gone".to_string())),
            }
        }
    }

    fn revalidate_targets(&mut self) {
        let stale: Vec<TaskId> = self
            .pool
            .iter()
            .filter(|entry| !entry.state.is_terminal())
            .filter(|entry| {
                entry
                    .task
                    .target()
                    .map_or(false, |target| !self.tree.is_valid(target))
            })
            .map(|entry| entry.id)
            .collect();
        for id in stale {
            self.fail(id, TaskError::TargetInvalidated);
        }
    }

    /// Drive everything that became possible, then drop finished tasks
    fn settle(&mut self) {
        self.run_ready();
        while self.tree_dirty {
            self.tree_dirty = false;
            self.revalidate_targets();
            self.observers.publish_tree(Arc::clone(&self.tree));
            self.run_ready();
        }
        self.reap();
    }

    fn reap(&mut self) {
        for id in self.pool.ids().into_iter().rev() {
            let Some(entry) = self.pool.get(id) else {
                continue;
            };
            if !entry.state.is_terminal() || !entry.handles.is_empty() {
                continue;
            }
            if entry.dependents.iter().any(|d| self.pool.contains(*d)) {
                continue;
            }
            if self.bootstrap_of(entry.connection) == Some(id) {
                continue;
            }
            self.pool.remove(id);
            trace!(task = %id, "Task reaped");
        }
    }

    fn dispatch_tagged(&mut self, connection: ConnectionId, state: State) -> Dispatch {
        let Some(handle) = state.tag.clone() else {
            return Dispatch::Unrouted;
        };
        if let Some(link) = self.links.get_mut(&connection) {
            link.command_completed(&handle);
        }
        let Some(owner) = self.pool.reclaim(connection, &handle) else {
            warn!(%connection, tag = %handle, "No task owns this tag: {} {}", state.status, state.text);
            self.record_unrouted(connection, &state, UnroutedReason::UnknownHandle);
            return Dispatch::Unrouted;
        };

        let finished = self
            .pool
            .state(owner)
            .map_or(true, |state| state.is_terminal());
        if finished {
            debug!(task = %owner, tag = %handle, "Late completion for finished task: {} {}", state.status, state.text);
            self.record_unrouted(connection, &state, UnroutedReason::TaskFinished { task: owner });
            return Dispatch::Consumed { task: owner };
        }
        if self.target_gone(owner) {
            self.fail(owner, TaskError::TargetInvalidated);
            self.record_unrouted(connection, &state, UnroutedReason::TaskFinished { task: owner });
            return Dispatch::Consumed { task: owner };
        }

        match self.with_task(owner, |task, ctx| task.handle_state(ctx, &handle, &state)) {
            Some(Handled::Step(step)) => {
                self.apply_step(owner, step);
                Dispatch::Delivered { task: owner }
            }
            Some(Handled::NotMine) | None => {
                warn!(task = %owner, tag = %handle, "Task refused its own tagged response");
                self.record_unrouted(connection, &state, UnroutedReason::Refused { task: owner });
                Dispatch::Unrouted
            }
        }
    }

    fn dispatch_untagged(&mut self, connection: ConnectionId, response: &Response) -> Dispatch {
        if let Response::State(state) = response {
            if state.status == ResponseStatus::Bye {
                info!(%connection, "Server said BYE: {}", state.text);
            }
        }

        let mut claimed = 0;
        for id in self.pool.live_on(connection) {
            // an earlier receiver may have ended this one
            if self.pool.state(id).map_or(true, |state| state.is_terminal()) {
                continue;
            }
            if let Some(Handled::Step(step)) =
                self.with_task(id, |task, ctx| task.handle_untagged(ctx, response))
            {
                claimed += 1;
                self.apply_step(id, step);
            }
        }
        if claimed == 0 {
            self.diagnostics.unclaimed_untagged += 1;
            trace!(%connection, "Untagged response not claimed: {:?}", response);
        }
        Dispatch::Broadcast { claimed }
    }

    fn record_unrouted(&mut self, connection: ConnectionId, state: &State, reason: UnroutedReason) {
        if let Some(tag) = state.tag.clone() {
            self.diagnostics.record_unrouted(UnroutedResponse {
                connection,
                tag,
                status: state.status,
                text: state.text.clone(),
                reason,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::Parser;

    fn model() -> Model {
        Model::new(Credentials::new("user", "secret"))
    }

    fn feed(model: &mut Model, connection: ConnectionId, wire: &str) -> Vec<Dispatch> {
        let mut parser = Parser::new();
        parser.feed(wire.as_bytes());
        let mut out = Vec::new();
        while let Some(record) = parser.next_record() {
            out.push(model.on_response(connection, record.unwrap()));
        }
        out
    }

    #[test]
    fn test_bootstrap_is_shared() {
        let mut model = model();
        let first = model.connect();
        let second = model.connect();
        assert_eq!(first, second);
        assert_eq!(model.take_transport_requests().len(), 1);
        assert!(model.take_transport_requests().is_empty());
    }

    #[test]
    fn test_completed_bootstrap_is_kept_while_link_lives() {
        let mut model = model();
        let bootstrap = model.connect();
        let connection = model.current_connection().unwrap();
        feed(&mut model, connection, "* PREAUTH hi\r\n");
        assert_eq!(model.task_state(bootstrap), Some(TaskState::Completed));
        assert_eq!(model.task_count(), 1);

        model.on_connection_lost(connection, "eof");
        assert_eq!(model.task_count(), 0);
        assert_eq!(model.link_status(connection), None);
        assert_eq!(model.task_state(bootstrap), Some(TaskState::Completed));
    }

    #[test]
    fn test_missing_prerequisite_is_rejected() {
        let mut model = model();
        let inbox = model.lookup("INBOX").unwrap();
        let result = model.submit_after(TaskRequest::MessageCount { mailbox: inbox }, TaskId(99));
        assert!(matches!(result, Err(ImapError::InvalidState(_))));
        assert_eq!(model.task_count(), 0);
    }

    #[test]
    fn test_idle_link_detection() {
        let mut model = model();
        assert!(!model.has_idle_link());
        let connection = {
            model.connect();
            model.current_connection().unwrap()
        };
        model.on_transport_opened(connection);
        assert!(!model.has_idle_link());
        feed(&mut model, connection, "* PREAUTH hi\r\n");
        assert!(model.has_idle_link());

        let id = model.submit(TaskRequest::Noop).unwrap();
        assert!(!model.has_idle_link());
        feed(&mut model, connection, "A1 OK NOOP done\r\n");
        assert_eq!(model.outcome(id), Some(&Ok(TaskOutput::Noop)));
        assert!(model.has_idle_link());
    }

    #[test]
    fn test_shutdown_logs_out() {
        let mut model = model();
        model.connect();
        let connection = model.current_connection().unwrap();
        feed(&mut model, connection, "* PREAUTH hi\r\n");
        model.shutdown();
        let sent: Vec<String> = model
            .take_outbound(connection)
            .into_iter()
            .map(|c| c.summary)
            .collect();
        assert_eq!(sent, vec!["LOGOUT"]);
        assert_eq!(model.closing_links(), vec![connection]);
        assert_eq!(
            feed(&mut model, connection, "* BYE\r\nA1 OK bye\r\n")[1],
            Dispatch::Consumed {
                task: model.bootstrap_of(connection).unwrap()
            }
        );
    }
}
