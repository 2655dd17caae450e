//! Client side of the hazard line protocol

use log::{debug, warn};
use shared::protocol::{parse_info_line, parse_infos_header};
use shared::{Poi, ProtocolError, Request};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Time allowed for connecting and for each answer line
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unable to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid answer from the server: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no response from the server within {0:?}")]
    Timeout(Duration),
    #[error("server closed the connection")]
    Closed,
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn send_line(&mut self, line: &str) -> Result<(), ClientError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self, limit: Duration) -> Result<String, ClientError> {
        timeout(limit, self.lines.next_line())
            .await
            .map_err(|_| ClientError::Timeout(limit))??
            .ok_or(ClientError::Closed)
    }

    async fn read_infos(&mut self, limit: Duration) -> Result<Vec<Poi>, ClientError> {
        let header = self.read_line(limit).await?;
        let count = parse_infos_header(&header)?;

        let mut pois = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let line = self.read_line(limit).await?;
            pois.push(parse_info_line(&line)?);
        }
        Ok(pois)
    }
}

/// Connection to a hazard server.
///
/// The TCP connection is opened on first use and dropped after any failure;
/// the next call opens a fresh one. Nothing is retried automatically.
pub struct Client {
    addr: String,
    timeout: Duration,
    connection: Option<Connection>,
}

impl Client {
    /// Creates a client without connecting yet
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            connection: None,
        }
    }

    /// Creates a client and opens its connection right away
    pub async fn connect(addr: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let mut client = Self::new(addr, timeout);
        client.ensure_connected().await?;
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Drops the connection; the next request reconnects
    pub fn disconnect(&mut self) {
        if self.connection.take().is_some() {
            debug!("Disconnected from {}", self.addr);
        }
    }

    async fn open(&self) -> Result<Connection, ClientError> {
        let stream = timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
            .map_err(|source| ClientError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", self.addr);

        let (reader, writer) = stream.into_split();
        Ok(Connection {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn ensure_connected(&mut self) -> Result<&mut Connection, ClientError> {
        if self.connection.is_none() {
            let connection = self.open().await?;
            self.connection = Some(connection);
        }
        self.connection.as_mut().ok_or(ClientError::Closed)
    }

    /// Sends a request that gets no answer
    async fn send(&mut self, request: Request) -> Result<(), ClientError> {
        let line = request.encode();
        let result = self.ensure_connected().await?.send_line(&line).await;
        if let Err(e) = &result {
            warn!("Request to {} failed: {}", self.addr, e);
            self.disconnect();
        }
        result
    }

    /// Reports a hazard. The server treats it as a confirmation when a
    /// hazard of the same type is already known nearby.
    pub async fn submit(&mut self, poi: &Poi) -> Result<(), ClientError> {
        self.send(Request::Submit(poi.clone())).await
    }

    /// Reports that a hazard previously received from the server is gone
    pub async fn not_seen(&mut self, poi: &Poi) -> Result<(), ClientError> {
        self.send(Request::NotSeen(poi.clone())).await
    }

    /// Asks for the active hazards around a position
    pub async fn get_infos(&mut self, latitude: f64, longitude: f64) -> Result<Vec<Poi>, ClientError> {
        let line = Request::GetInfos {
            latitude,
            longitude,
        }
        .encode();
        let limit = self.timeout;

        let connection = self.ensure_connected().await?;
        let result = match connection.send_line(&line).await {
            Ok(()) => connection.read_infos(limit).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!("GET_INFOS to {} failed: {}", self.addr, e);
            self.disconnect();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shared::PoiType;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accepts one connection, records the request lines and answers each
    /// `GET_INFOS` with `reply`.
    async fn fake_server(reply: &'static str) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let mut received = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.starts_with("GET_INFOS") {
                    writer.write_all(reply.as_bytes()).await.unwrap();
                }
                received.push(line);
            }
            received
        });

        (addr, handle)
    }

    fn sample_poi() -> Poi {
        Poi::new(
            PoiType::MobileSpeedCam,
            45.764,
            4.8357,
            Utc.with_ymd_and_hms(2013, 1, 15, 7, 5, 0).unwrap(),
        )
        .with_counters(1, 0)
    }

    #[tokio::test]
    async fn test_lazy_connection() {
        let client = Client::new("127.0.0.1:1", DEFAULT_TIMEOUT);
        assert!(!client.is_connected());
        assert_eq!(client.addr(), "127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_submit_and_not_seen_lines() {
        let (addr, server) = fake_server("").await;
        let mut client = Client::connect(addr, DEFAULT_TIMEOUT).await.unwrap();

        client.submit(&sample_poi()).await.unwrap();
        client.not_seen(&sample_poi()).await.unwrap();
        client.disconnect();

        let received = server.await.unwrap();
        assert_eq!(
            received,
            vec![
                "SUBMIT MOBILE_SPEED_CAM 45.764 4.8357 2013-01-15T07:05:00.000+0000 1".to_string(),
                "NOT_SEEN MOBILE_SPEED_CAM 45.764 4.8357 2013-01-15T07:05:00.000+0000".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_get_infos() {
        let (addr, server) = fake_server(
            "INFOS 2\n\
             INFO ACCIDENT 48.8566 2.3522 2012-05-03T14:22:01.123+0000 3\n\
             INFO ROADWORKS 48.86 2.35 2012-05-03T16:22:01.000+0200 1\n",
        )
        .await;
        let mut client = Client::new(addr, DEFAULT_TIMEOUT);

        let pois = client.get_infos(48.8566, 2.3522).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(pois.len(), 2);
        assert_eq!(pois[0].poi_type(), PoiType::Accident);
        assert_eq!(pois[0].confirmations(), 3);
        assert_eq!(pois[1].created_at(), Utc.with_ymd_and_hms(2012, 5, 3, 14, 22, 1).unwrap());

        client.disconnect();
        assert_eq!(server.await.unwrap(), vec!["GET_INFOS 48.8566 2.3522".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_answer_drops_connection() {
        let (addr, _server) = fake_server("HELLO\n").await;
        let mut client = Client::new(addr, DEFAULT_TIMEOUT);

        let result = client.get_infos(0.0, 0.0).await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_missing_info_lines() {
        // The server announces two entries, sends one, then hangs up
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"INFOS 2\nINFO ACCIDENT 1.0 2.0 2012-05-03T14:22:01.000+0000 1\n")
                .await
                .unwrap();
        });

        let mut client = Client::new(addr, DEFAULT_TIMEOUT);
        let result = client.get_infos(1.0, 2.0).await;
        assert!(matches!(result, Err(ClientError::Closed) | Err(ClientError::Io(_))));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without answering
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let mut client = Client::new(addr, Duration::from_millis(100));
        let result = client.get_infos(1.0, 2.0).await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
        assert!(!client.is_connected());
        server.abort();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = Client::connect(addr, DEFAULT_TIMEOUT).await;
        assert!(matches!(result, Err(ClientError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_reconnects_after_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // First connection gets garbage, the second a valid answer
            let (mut first, _) = listener.accept().await.unwrap();
            first.write_all(b"INFOS x\n").await.unwrap();
            let (mut second, _) = listener.accept().await.unwrap();
            second.write_all(b"INFOS 0\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut client = Client::new(addr, DEFAULT_TIMEOUT);
        assert!(client.get_infos(0.0, 0.0).await.is_err());
        assert!(client.get_infos(0.0, 0.0).await.unwrap().is_empty());
    }
}
