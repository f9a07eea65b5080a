//! End-to-end runs of the engine over in-memory transports driven by a scripted server.

use async_trait::async_trait;
use imap_taskengine::config::{EngineConfig, ServerConfig};
use imap_taskengine::engine::Engine;
use imap_taskengine::imap::{BoxedStream, Connector, ImapError, ImapResult};
use imap_taskengine::tasks::{TaskError, TaskRequest, TaskState};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{
    split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::oneshot;
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(5);

/// Hands out pre-made in-memory streams, one per connection attempt
struct ScriptedConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl ScriptedConnector {
    fn with_servers(count: usize) -> (Arc<Self>, Vec<Server>) {
        let mut streams = VecDeque::new();
        let mut servers = Vec::new();
        for _ in 0..count {
            let (client, server) = tokio::io::duplex(16 * 1024);
            streams.push_back(client);
            servers.push(Server::new(server));
        }
        let connector = Arc::new(Self {
            streams: Mutex::new(streams),
        });
        (connector, servers)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> ImapResult<BoxedStream> {
        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(ImapError::connection("no scripted server left")),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Server side of one in-memory connection
struct Server {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Server {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next command line without CRLF, `None` once the client closed
    async fn command(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = timeout(STEP, self.reader.read_line(&mut line))
            .await
            .expect("client went quiet")
            .unwrap();
        (read > 0).then(|| line.trim_end().to_string())
    }

    async fn expect(&mut self, expected: &str) -> String {
        let line = self.command().await.expect("client closed the connection");
        assert_eq!(line, expected);
        tag_of(&line)
    }

    /// Answer LOGOUT and hang up
    async fn logout(mut self, tag: &str) {
        self.expect(&format!("{} LOGOUT", tag)).await;
        self.send(&format!("* BYE logging out\r\n{} OK LOGOUT completed\r\n", tag))
            .await;
    }
}

fn tag_of(line: &str) -> String {
    line.split(' ').next().unwrap_or_default().to_string()
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::new(ServerConfig::new(
        "imap.test".to_string(),
        993,
        "user".to_string(),
        "secret".to_string(),
    ));
    config.engine.retry.base_delay_ms = 1;
    config.engine.retry.max_delay_ms = 5;
    config.engine.retry.jitter = false;
    config
}

#[tokio::test]
async fn test_message_count_end_to_end() {
    let (connector, mut servers) = ScriptedConnector::with_servers(1);
    let mut server = servers.remove(0);
    let script = tokio::spawn(async move {
        server.send("* PREAUTH IMAP4rev1 ready\r\n").await;
        server.expect("A1 STATUS INBOX (MESSAGES)").await;
        server
            .send("* STATUS INBOX (MESSAGES 42)\r\nA1 OK STATUS completed\r\n")
            .await;
        server.logout("A2").await;
    });

    let engine = Engine::spawn(&config(), connector);
    let count = timeout(STEP, engine.message_count("INBOX")).await.unwrap();
    assert_eq!(count.unwrap(), 42);

    let inbox = engine.lookup("INBOX").unwrap();
    assert_eq!(engine.tree().resolve(inbox).unwrap().status().messages, Some(42));

    timeout(STEP, engine.shutdown()).await.unwrap().unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_pipelined_tasks_complete_out_of_order() {
    let (connector, mut servers) = ScriptedConnector::with_servers(1);
    let mut server = servers.remove(0);
    let script = tokio::spawn(async move {
        server.send("* PREAUTH ready\r\n").await;
        let first = server.command().await.unwrap();
        let second = server.command().await.unwrap();
        let (status, examine) = if first.contains("STATUS") {
            (first, second)
        } else {
            (second, first)
        };
        assert!(examine.ends_with("EXAMINE INBOX"));

        // answer the later command first
        server
            .send(&format!(
                "* 3 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n{} OK [READ-ONLY] done\r\n",
                tag_of(&examine)
            ))
            .await;
        server
            .send(&format!(
                "* STATUS INBOX (MESSAGES 3)\r\n{} OK done\r\n",
                tag_of(&status)
            ))
            .await;
        server.logout("A3").await;
    });

    let engine = Engine::spawn(&config(), connector);
    let (count, selected) = timeout(
        STEP,
        futures::future::join(engine.message_count("INBOX"), engine.select("INBOX", true)),
    )
    .await
    .unwrap();
    assert_eq!(count.unwrap(), 3);
    let status = selected.unwrap();
    assert_eq!(status.messages, Some(3));
    assert_eq!(status.uid_validity, Some(7));

    timeout(STEP, engine.shutdown()).await.unwrap().unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_dropped_connection_is_replaced() {
    let (connector, mut servers) = ScriptedConnector::with_servers(2);
    let mut second = servers.remove(1);
    let mut first = servers.remove(0);
    let script = tokio::spawn(async move {
        first.send("* PREAUTH ready\r\n").await;
        first.expect("A1 STATUS INBOX (MESSAGES)").await;
        drop(first);

        second.send("* PREAUTH ready\r\n").await;
        second.expect("A1 STATUS INBOX (MESSAGES)").await;
        second
            .send("* STATUS INBOX (MESSAGES 9)\r\nA1 OK done\r\n")
            .await;
        second.logout("A2").await;
    });

    let engine = Engine::spawn(&config(), connector);
    let lost = timeout(STEP, engine.message_count("INBOX")).await.unwrap();
    assert!(matches!(
        lost,
        Err(ImapError::Task(TaskError::ConnectionLost(_)))
    ));

    let count = timeout(STEP, engine.message_count("INBOX")).await.unwrap();
    assert_eq!(count.unwrap(), 9);

    timeout(STEP, engine.shutdown()).await.unwrap().unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_observers_follow_progress() {
    let (connector, mut servers) = ScriptedConnector::with_servers(1);
    let mut server = servers.remove(0);
    let (go_tx, go_rx) = oneshot::channel::<()>();
    let script = tokio::spawn(async move {
        go_rx.await.unwrap();
        server.send("* PREAUTH ready\r\n").await;
        server.expect("A1 STATUS INBOX (MESSAGES)").await;
        server
            .send("* STATUS INBOX (MESSAGES 5)\r\nA1 OK done\r\n")
            .await;
        server.logout("A2").await;
    });

    let engine = Engine::spawn(&config(), connector);
    let mut activity = engine.activity();
    let mut events = engine.subscribe_events();
    let inbox = engine.lookup("INBOX").unwrap();

    let ticket = engine
        .submit(TaskRequest::MessageCount { mailbox: inbox })
        .await
        .unwrap();
    let id = ticket.id();
    {
        let busy = timeout(STEP, activity.wait_for(|snapshot| snapshot.is_busy()))
            .await
            .unwrap()
            .unwrap();
        assert!(busy.descriptions().contains(&"Counting messages in INBOX"));
    }

    go_tx.send(()).unwrap();
    let output = timeout(STEP, ticket.wait()).await.unwrap().unwrap();
    assert_eq!(output, imap_taskengine::tasks::TaskOutput::MessageCount(5));

    timeout(STEP, activity.wait_for(|snapshot| !snapshot.is_busy()))
        .await
        .unwrap()
        .unwrap();
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.id == id {
            seen.push(event.state);
        }
    }
    assert_eq!(seen.last(), Some(&TaskState::Completed));
    assert!(seen.contains(&TaskState::Running));

    timeout(STEP, engine.shutdown()).await.unwrap().unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_cancel_through_handle() {
    let (connector, mut servers) = ScriptedConnector::with_servers(1);
    let mut server = servers.remove(0);
    let (sent_tx, sent_rx) = oneshot::channel::<()>();
    let script = tokio::spawn(async move {
        server.send("* PREAUTH ready\r\n").await;
        server.expect("A1 STATUS INBOX (MESSAGES)").await;
        sent_tx.send(()).unwrap();
        // the reply arrives after the task was cancelled
        server.expect("A2 LOGOUT").await;
        server
            .send("A1 OK STATUS completed\r\n* BYE\r\nA2 OK LOGOUT completed\r\n")
            .await;
    });

    let engine = Engine::spawn(&config(), connector);
    let inbox = engine.lookup("INBOX").unwrap();
    let ticket = engine
        .submit(TaskRequest::MessageCount { mailbox: inbox })
        .await
        .unwrap();
    timeout(STEP, sent_rx).await.unwrap().unwrap();

    assert!(engine.cancel(ticket.id()).await.unwrap());
    assert!(!engine.cancel(ticket.id()).await.unwrap());
    assert!(matches!(
        ticket.wait().await,
        Err(ImapError::Task(TaskError::Cancelled))
    ));

    timeout(STEP, engine.shutdown()).await.unwrap().unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_idle_connection_gets_keepalive() {
    let (connector, mut servers) = ScriptedConnector::with_servers(1);
    let mut server = servers.remove(0);
    let script = tokio::spawn(async move {
        server.send("* PREAUTH ready\r\n").await;
        server.expect("A1 NOOP").await;
        server.send("A1 OK NOOP completed\r\n").await;
        server.logout("A2").await;
    });

    let mut config = config();
    config.engine.keepalive_seconds = 1;
    let engine = Engine::spawn(&config, connector);
    timeout(STEP, async { engine.connect().await?.wait().await })
        .await
        .unwrap()
        .unwrap();

    let mut events = engine.subscribe_events();
    let keepalive = timeout(STEP, async {
        loop {
            let event = events.recv().await.unwrap();
            if event.description == "Keeping connection alive" && event.state == TaskState::Completed {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(keepalive.state, TaskState::Completed);

    timeout(STEP, engine.shutdown()).await.unwrap().unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_locate_lists_missing_levels() {
    let (connector, mut servers) = ScriptedConnector::with_servers(1);
    let mut server = servers.remove(0);
    let script = tokio::spawn(async move {
        server.send("* PREAUTH ready\r\n").await;
        server.expect("A1 LIST \"\" \"%\"").await;
        server
            .send("* LIST () \".\" INBOX\r\n* LIST (\\HasChildren) \".\" Projects\r\nA1 OK done\r\n")
            .await;
        server.expect("A2 LIST \"\" \"Projects.%\"").await;
        server
            .send("* LIST () \".\" Projects.Rust\r\nA2 OK done\r\n")
            .await;
        server.expect("A3 STATUS Projects.Rust (MESSAGES)").await;
        server
            .send("* STATUS Projects.Rust (MESSAGES 11)\r\nA3 OK done\r\n")
            .await;
        server.logout("A4").await;
    });

    let engine = Engine::spawn(&config(), connector);
    let rust = timeout(STEP, engine.locate("Projects.Rust"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(engine.lookup("Projects.Rust"), Some(rust));
    let count = timeout(STEP, engine.message_count("Projects.Rust"))
        .await
        .unwrap();
    assert_eq!(count.unwrap(), 11);

    timeout(STEP, engine.shutdown()).await.unwrap().unwrap();
    script.await.unwrap();
}
