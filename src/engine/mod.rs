//! Async front end of the task engine.
//!
//! [`Engine::spawn`] starts one tokio task that owns the [`Model`]. Callers talk to it through
//! a cloneable [`EngineHandle`]; every connection gets a reader task and a writer task that
//! exchange bytes with the server and report back over an event channel. Task logic only ever
//! runs on the engine task.

pub mod retry;

pub use retry::{RetryConfig, RetryManager};

use crate::config::EngineConfig;
use crate::imap::{Connector, ImapError, ImapResult, Inbound, ResponseReader};
use crate::model::{
    ActivitySnapshot, ConnectionId, Diagnostics, MailboxRef, MailboxStatus, MailboxTree, Model,
    OutboundCommand, TaskEvent,
};
use crate::tasks::{TaskId, TaskOutcome, TaskOutput, TaskRequest};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// How long a reader keeps draining after its writer closed
const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// How long shutdown waits for transports to close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

enum Request {
    Connect {
        reply: oneshot::Sender<ImapResult<TaskTicket>>,
    },
    Submit {
        request: TaskRequest,
        after: Option<TaskId>,
        reply: oneshot::Sender<ImapResult<TaskTicket>>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Diagnostics {
        reply: oneshot::Sender<Diagnostics>,
    },
}

enum Message {
    Request(Request),
    Shutdown(oneshot::Sender<()>),
}

/// Reported by connection tasks
enum ConnectionEvent {
    Opened {
        connection: ConnectionId,
        writer: mpsc::UnboundedSender<OutboundCommand>,
    },
    Inbound {
        connection: ConnectionId,
        inbound: Inbound,
    },
    Closed {
        connection: ConnectionId,
        reason: String,
    },
}

/// Pending result of a submitted task
#[derive(Debug)]
pub struct TaskTicket {
    id: TaskId,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl TaskTicket {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task to complete or fail
    pub async fn wait(self) -> ImapResult<TaskOutput> {
        let outcome = self.outcome.await.map_err(|_| ImapError::EngineClosed)?;
        Ok(outcome?)
    }
}

pub struct Engine {
    model: Model,
    connector: Arc<dyn Connector>,
    retry: RetryManager,
    messages: mpsc::Receiver<Message>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    writers: HashMap<ConnectionId, mpsc::UnboundedSender<OutboundCommand>>,
    transports: HashSet<ConnectionId>,
    keepalive: Duration,
}

impl Engine {
    /// Start the engine on the current tokio runtime
    pub fn spawn(config: &EngineConfig, connector: Arc<dyn Connector>) -> EngineHandle {
        let model = Model::new(config.server.credentials());
        let (messages_tx, messages) = mpsc::channel(config.engine.request_queue.max(1));
        let (events_tx, events) = mpsc::unbounded_channel();

        let handle = EngineHandle {
            messages: messages_tx,
            tree: model.subscribe_tree(),
            activity: model.subscribe_activity(),
            events: model.event_sender(),
        };

        info!(peer = %connector.describe(), "Starting IMAP task engine");
        let engine = Engine {
            model,
            connector,
            retry: RetryManager::new(RetryConfig::from(&config.engine.retry)),
            messages,
            events,
            events_tx,
            writers: HashMap::new(),
            transports: HashSet::new(),
            keepalive: Duration::from_secs(config.engine.keepalive_seconds.max(1)),
        };
        tokio::spawn(engine.run());
        handle
    }

    async fn run(mut self) {
        let mut keepalive = interval(self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        keepalive.tick().await;

        let reply = loop {
            tokio::select! {
                message = self.messages.recv() => match message {
                    Some(Message::Request(request)) => {
                        self.handle_request(request);
                        keepalive.reset();
                    }
                    Some(Message::Shutdown(reply)) => break Some(reply),
                    None => break None,
                },
                Some(event) = self.events.recv() => {
                    self.handle_event(event);
                    keepalive.reset();
                }
                _ = keepalive.tick() => self.keepalive(),
            }
            self.pump();
        };

        self.close().await;
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { reply } => {
                let id = self.model.connect();
                let _ = reply.send(self.ticket(id));
            }
            Request::Submit {
                request,
                after,
                reply,
            } => {
                let submitted = match after {
                    Some(prerequisite) => self.model.submit_after(request, prerequisite),
                    None => self.model.submit(request),
                };
                let _ = reply.send(submitted.and_then(|id| self.ticket(id)));
            }
            Request::Cancel { id, reply } => {
                let _ = reply.send(self.model.cancel(id));
            }
            Request::Diagnostics { reply } => {
                let _ = reply.send(self.model.diagnostics().clone());
            }
        }
    }

    fn ticket(&mut self, id: TaskId) -> ImapResult<TaskTicket> {
        let outcome = self
            .model
            .watch_task(id)
            .ok_or_else(|| ImapError::invalid_state(format!("task {} is unknown", id)))?;
        Ok(TaskTicket { id, outcome })
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { connection, writer } => {
                if self.model.link_status(connection).is_none() {
                    debug!(%connection, "Transport opened for a forgotten connection");
                    return;
                }
                self.model.on_transport_opened(connection);
                self.writers.insert(connection, writer);
            }
            ConnectionEvent::Inbound {
                connection,
                inbound,
            } => {
                if self.model.link_status(connection).is_none() {
                    trace!(%connection, "Dropping input for a forgotten connection");
                    return;
                }
                match inbound {
                    Inbound::Response(response) => {
                        let dispatch = self.model.on_response(connection, response);
                        trace!(%connection, ?dispatch, "Response dispatched");
                    }
                    Inbound::Malformed(error) => self.model.on_decode_error(connection, &error),
                }
            }
            ConnectionEvent::Closed { connection, reason } => {
                self.writers.remove(&connection);
                self.transports.remove(&connection);
                self.model.on_connection_lost(connection, &reason);
            }
        }
    }

    /// Open requested transports, flush queued commands and close retired links
    fn pump(&mut self) {
        for connection in self.model.take_transport_requests() {
            self.open(connection);
        }

        let connections: Vec<ConnectionId> = self.writers.keys().copied().collect();
        for connection in connections {
            let outbound = self.model.take_outbound(connection);
            let Some(writer) = self.writers.get(&connection) else {
                continue;
            };
            for command in outbound {
                debug!(%connection, tag = %command.handle, "Sending {}", command.summary);
                if writer.send(command).is_err() {
                    warn!(%connection, "Writer is gone, dropping queued commands");
                    break;
                }
            }
        }

        for connection in self.model.closing_links() {
            if self.writers.remove(&connection).is_some() {
                debug!(%connection, "Closing transport");
            }
        }
    }

    fn keepalive(&mut self) {
        if !self.model.has_idle_link() {
            return;
        }
        debug!("Connection idle, sending keep-alive");
        if let Err(e) = self.model.submit(TaskRequest::Noop) {
            warn!("Failed to submit keep-alive: {}", e);
        }
    }

    fn open(&mut self, connection: ConnectionId) {
        let connector = Arc::clone(&self.connector);
        let retry = self.retry.clone();
        let events = self.events_tx.clone();
        self.transports.insert(connection);
        info!(%connection, peer = %connector.describe(), "Opening transport");

        tokio::spawn(async move {
            let stream = match retry.execute_with_retry(|| connector.connect()).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(ConnectionEvent::Closed {
                        connection,
                        reason: format!("connect failed: {}", e),
                    });
                    return;
                }
            };

            let (read_half, write_half) = tokio::io::split(stream);
            let (writer_tx, writer_rx) = mpsc::unbounded_channel();
            let (done_tx, done_rx) = oneshot::channel();
            tokio::spawn(write_loop(connection, write_half, writer_rx, done_tx));

            if events
                .send(ConnectionEvent::Opened {
                    connection,
                    writer: writer_tx,
                })
                .is_err()
            {
                return;
            }
            let reason = read_loop(connection, read_half, &events, done_rx).await;
            let _ = events.send(ConnectionEvent::Closed { connection, reason });
        });
    }

    /// Log out, then wait a bounded time for the transports to close
    async fn close(&mut self) {
        info!("Shutting down IMAP task engine");
        self.model.shutdown();
        self.pump();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.transports.is_empty() {
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => {
                    self.handle_event(event);
                    self.pump();
                }
                _ => {
                    warn!("{} transports still open at shutdown", self.transports.len());
                    break;
                }
            }
        }
        info!("IMAP task engine stopped");
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    connection: ConnectionId,
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<OutboundCommand>,
    done: oneshot::Sender<()>,
) {
    while let Some(command) = commands.recv().await {
        trace!(%connection, tag = %command.handle, "Writing {} bytes", command.bytes.len());
        let written = async {
            writer.write_all(&command.bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(%connection, "Write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    let _ = done.send(());
}

/// Forward decoded records until the stream ends; returns why it ended
async fn read_loop<R: AsyncRead + Unpin>(
    connection: ConnectionId,
    reader: R,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    mut writer_done: oneshot::Receiver<()>,
) -> String {
    let mut reader = ResponseReader::new(reader);
    let mut deadline: Option<Instant> = None;

    loop {
        let next = match deadline {
            None => tokio::select! {
                next = reader.next_inbound() => next,
                _ = &mut writer_done => {
                    deadline = Some(Instant::now() + CLOSE_GRACE);
                    continue;
                }
            },
            Some(deadline) => match timeout_at(deadline, reader.next_inbound()).await {
                Ok(next) => next,
                Err(_) => return "closed locally".to_string(),
            },
        };

        match next {
            Ok(Some(inbound)) => {
                if events
                    .send(ConnectionEvent::Inbound {
                        connection,
                        inbound,
                    })
                    .is_err()
                {
                    return "engine stopped".to_string();
                }
            }
            Ok(None) => return "server closed the connection".to_string(),
            Err(e) => return format!("read failed: {}", e),
        }
    }
}

/// Cloneable client of a running engine
#[derive(Clone)]
pub struct EngineHandle {
    messages: mpsc::Sender<Message>,
    tree: watch::Receiver<Arc<MailboxTree>>,
    activity: watch::Receiver<ActivitySnapshot>,
    events: broadcast::Sender<TaskEvent>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> ImapResult<T> {
        let (tx, rx) = oneshot::channel();
        self.messages
            .send(Message::Request(build(tx)))
            .await
            .map_err(|_| ImapError::EngineClosed)?;
        rx.await.map_err(|_| ImapError::EngineClosed)
    }

    /// Make sure a connection is being established; resolves once it is authenticated
    pub async fn connect(&self) -> ImapResult<TaskTicket> {
        self.request(|reply| Request::Connect { reply }).await?
    }

    pub async fn submit(&self, request: TaskRequest) -> ImapResult<TaskTicket> {
        self.request(|reply| Request::Submit {
            request,
            after: None,
            reply,
        })
        .await?
    }

    /// Submit a task that starts only after `prerequisite` completed
    pub async fn submit_after(&self, request: TaskRequest, prerequisite: TaskId) -> ImapResult<TaskTicket> {
        self.request(|reply| Request::Submit {
            request,
            after: Some(prerequisite),
            reply,
        })
        .await?
    }

    /// Cancel a task and its dependents; false if it had already finished
    pub async fn cancel(&self, id: TaskId) -> ImapResult<bool> {
        self.request(|reply| Request::Cancel { id, reply }).await
    }

    pub async fn diagnostics(&self) -> ImapResult<Diagnostics> {
        self.request(|reply| Request::Diagnostics { reply }).await
    }

    pub async fn message_count(&self, path: &str) -> ImapResult<u32> {
        let mailbox = self.resolve(path)?;
        match self.run(TaskRequest::MessageCount { mailbox }).await? {
            TaskOutput::MessageCount(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Refresh the children of `path`; the empty path is the top level
    pub async fn list_children(&self, path: &str) -> ImapResult<Vec<MailboxRef>> {
        let parent = self.resolve(path)?;
        match self.run(TaskRequest::ListChildren { parent }).await? {
            TaskOutput::Mailboxes(children) => Ok(children),
            other => Err(unexpected(other)),
        }
    }

    pub async fn select(&self, path: &str, read_only: bool) -> ImapResult<MailboxStatus> {
        let mailbox = self.resolve(path)?;
        match self.run(TaskRequest::Select { mailbox, read_only }).await? {
            TaskOutput::Selected(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_mailbox(&self, parent: &str, name: &str) -> ImapResult<MailboxRef> {
        let parent = self.resolve(parent)?;
        let request = TaskRequest::CreateMailbox {
            parent,
            name: name.to_string(),
        };
        match self.run(request).await? {
            TaskOutput::MailboxCreated(mailbox) => Ok(mailbox),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_mailbox(&self, path: &str) -> ImapResult<()> {
        let mailbox = self.resolve(path)?;
        match self.run(TaskRequest::DeleteMailbox { mailbox }).await? {
            TaskOutput::MailboxDeleted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Rename `path` to `name` below `new_parent`; the empty parent is the top level
    pub async fn rename_mailbox(&self, path: &str, new_parent: &str, name: &str) -> ImapResult<MailboxRef> {
        let mailbox = self.resolve(path)?;
        let new_parent = self.resolve(new_parent)?;
        let request = TaskRequest::RenameMailbox {
            mailbox,
            new_parent,
            name: name.to_string(),
        };
        match self.run(request).await? {
            TaskOutput::MailboxRenamed(mailbox) => Ok(mailbox),
            other => Err(unexpected(other)),
        }
    }

    /// Find a mailbox, listing each missing level of its path on the server
    pub async fn locate(&self, path: &str) -> ImapResult<MailboxRef> {
        if let Some(found) = self.lookup(path) {
            return Ok(found);
        }
        self.list_children("").await?;
        let delimiter = self.tree().delimiter().unwrap_or("/").to_string();

        let mut prefix = String::new();
        for segment in path.split(delimiter.as_str()) {
            let parent = prefix.clone();
            if !prefix.is_empty() {
                prefix.push_str(&delimiter);
            }
            prefix.push_str(segment);
            if self.lookup(&prefix).is_none() && !parent.is_empty() {
                self.list_children(&parent).await?;
            }
        }
        self.resolve(path)
    }

    /// Mailbox at `path` in the latest tree snapshot
    pub fn lookup(&self, path: &str) -> Option<MailboxRef> {
        self.tree.borrow().find(path)
    }

    /// Latest tree snapshot
    pub fn tree(&self) -> Arc<MailboxTree> {
        Arc::clone(&self.tree.borrow())
    }

    pub fn subscribe_tree(&self) -> watch::Receiver<Arc<MailboxTree>> {
        self.tree.clone()
    }

    pub fn activity(&self) -> watch::Receiver<ActivitySnapshot> {
        self.activity.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Cancel everything, log out and stop the engine
    pub async fn shutdown(&self) -> ImapResult<()> {
        let (tx, rx) = oneshot::channel();
        self.messages
            .send(Message::Shutdown(tx))
            .await
            .map_err(|_| ImapError::EngineClosed)?;
        rx.await.map_err(|_| ImapError::EngineClosed)
    }

    fn resolve(&self, path: &str) -> ImapResult<MailboxRef> {
        self.lookup(path)
            .ok_or_else(|| ImapError::unknown_mailbox(path))
    }

    async fn run(&self, request: TaskRequest) -> ImapResult<TaskOutput> {
        self.submit(request).await?.wait().await
    }
}

fn unexpected(output: TaskOutput) -> ImapError {
    ImapError::invalid_state(format!("unexpected task output: {:?}", output))
}
