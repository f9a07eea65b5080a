use crate::config::ServerConfig;
use crate::imap::{DecodeError, ImapError, ImapResult, Parser, Response};
use async_trait::async_trait;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream as AsyncTcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

const READ_CHUNK: usize = 8 * 1024;

/// Byte stream a connection runs over: plain TCP, TLS, or an in-memory pipe in tests
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ImapStream for T {}

pub type BoxedStream = Box<dyn ImapStream>;

/// Opens the transport for a new connection
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> ImapResult<BoxedStream>;

    /// Peer description for logs
    fn describe(&self) -> String;
}

/// TCP connector with optional implicit TLS
pub struct TcpConnector {
    config: ServerConfig,
}

impl TcpConnector {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    async fn wrap_tls(&self, tcp_stream: AsyncTcpStream) -> ImapResult<BoxedStream> {
        let addr = self.config.address();
        tracing::info!("Starting TLS handshake with {}", addr);
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let domain = rustls::pki_types::ServerName::try_from(self.config.hostname.as_str())
            .map_err(|e| ImapError::tls(format!("Invalid hostname for TLS: {}", e)))?
            .to_owned();

        let tls_stream = connector.connect(domain, tcp_stream).await.map_err(|e| {
            tracing::error!("TLS handshake failed with {}: {}", addr, e);
            ImapError::tls(format!("TLS handshake failed: {}", e))
        })?;

        tracing::info!("TLS handshake with {} completed", addr);
        Ok(Box::new(tls_stream))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> ImapResult<BoxedStream> {
        let addr = self.config.address();
        let timeout_duration = Duration::from_secs(self.config.timeout_seconds);
        tracing::info!(
            "Attempting TCP connection to {} (timeout: {}s)",
            addr,
            self.config.timeout_seconds
        );

        let tcp_stream = timeout(
            timeout_duration,
            AsyncTcpStream::connect((self.config.hostname.as_str(), self.config.port)),
        )
        .await
        .map_err(|_| {
            tracing::error!("TCP connection to {} timed out", addr);
            ImapError::Timeout
        })?
        .map_err(|e| ImapError::connection(format!("Failed to connect to {}: {}", addr, e)))?;

        tracing::info!("TCP connection to {} established", addr);

        if self.config.use_tls {
            timeout(timeout_duration, self.wrap_tls(tcp_stream))
                .await
                .map_err(|_| ImapError::Timeout)?
        } else {
            Ok(Box::new(tcp_stream))
        }
    }

    fn describe(&self) -> String {
        self.config.address()
    }
}

/// What the reader hands to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Response(Response),
    Malformed(DecodeError),
}

/// Turns the read half of a connection into a sequence of decoded records
pub struct ResponseReader<R> {
    reader: R,
    parser: Parser,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ResponseReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Parser::new(),
            chunk: vec![0; READ_CHUNK],
        }
    }

    /// Next record, or `None` once the peer closed the stream
    pub async fn next_inbound(&mut self) -> ImapResult<Option<Inbound>> {
        loop {
            if let Some(record) = self.parser.next_record() {
                return Ok(Some(match record {
                    Ok(response) => Inbound::Response(response),
                    Err(error) => Inbound::Malformed(error),
                }));
            }
            let read = self.reader.read(&mut self.chunk).await?;
            if read == 0 {
                if self.parser.buffered() > 0 {
                    tracing::warn!(
                        "Connection closed with {} undecoded bytes",
                        self.parser.buffered()
                    );
                }
                return Ok(None);
            }
            self.parser.feed(&self.chunk[..read]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::UntaggedData;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_reader_reassembles_chunks() {
        let mock = Builder::new()
            .read(b"* OK hello\r\n* 3 EX")
            .read(b"ISTS\r\n")
            .build();
        let mut reader = ResponseReader::new(mock);

        match reader.next_inbound().await.unwrap() {
            Some(Inbound::Response(Response::State(state))) => assert_eq!(state.text, "hello"),
            other => panic!("Expected greeting, got {:?}", other),
        }
        assert_eq!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Response(Response::Data(UntaggedData::Exists(3))))
        );
        assert_eq!(reader.next_inbound().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_reports_malformed_and_continues() {
        let mock = Builder::new().read(b"A1 PERHAPS\r\n* 1 RECENT\r\n").build();
        let mut reader = ResponseReader::new(mock);

        assert!(matches!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Malformed(_))
        ));
        assert_eq!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Response(Response::Data(UntaggedData::Recent(1))))
        );
    }

    #[test]
    fn test_tcp_connector_describes_peer() {
        let connector = TcpConnector::new(ServerConfig::new(
            "imap.example.com".to_string(),
            993,
            "user".to_string(),
            "pass".to_string(),
        ));
        assert_eq!(connector.describe(), "imap.example.com:993");
    }
}
