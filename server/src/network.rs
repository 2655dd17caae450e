//! TCP front end: accept loop, per-connection line dispatch and shutdown

use crate::client_manager::ClientManager;
use crate::consensus::ConsensusPolicy;
use log::{debug, error, info, warn};
use shared::{ProtocolError, Request, Response, DEFAULT_PORT};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Connections served at the same time; others wait in the listen backlog
    pub max_clients: usize,
    /// Close a connection after this long without a complete line. None disables it.
    pub idle_timeout: Option<Duration>,
    /// Period of the connection statistics log line
    pub stats_interval: Duration,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_clients: 32,
            idle_timeout: Some(Duration::from_secs(300)),
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// Reason a single connection was closed abnormally
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no command received for {0:?}")]
    IdleTimeout(Duration),
}

/// Serves the line protocol on one stream.
#[derive(Clone)]
pub struct ConnectionHandler {
    policy: ConsensusPolicy,
    clients: Arc<RwLock<ClientManager>>,
    idle_timeout: Option<Duration>,
}

impl ConnectionHandler {
    pub fn new(
        policy: ConsensusPolicy,
        clients: Arc<RwLock<ClientManager>>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            policy,
            clients,
            idle_timeout,
        }
    }

    /// Reads commands until the client hangs up, sends an empty line, sends
    /// something malformed, goes idle, or `shutdown` flips to true.
    pub async fn serve<S>(
        &self,
        stream: S,
        session_id: u32,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        loop {
            if *shutdown.borrow() {
                debug!("Session {} closed by shutdown", session_id);
                return Ok(());
            }

            // A dropped sender also means stop
            let line = tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Session {} interrupted by shutdown", session_id);
                    return Ok(());
                }
                line = self.read_line(&mut lines) => line?,
            };

            let line = match line {
                Some(line) => line,
                None => {
                    debug!("Session {} reached end of stream", session_id);
                    return Ok(());
                }
            };

            if line.trim_end_matches('\r').is_empty() {
                debug!("Session {} ended with an empty line", session_id);
                return Ok(());
            }

            let request = Request::parse(&line)?;
            debug!("Session {}: {:?}", session_id, request);
            self.clients.write().await.record_command(session_id);

            if let Some(response) = self.dispatch(request) {
                for reply in response.encode() {
                    writer.write_all(reply.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                writer.flush().await?;
            }
        }
    }

    async fn read_line<R>(&self, lines: &mut Lines<R>) -> Result<Option<String>, ConnectionError>
    where
        R: AsyncBufRead + Unpin,
    {
        match self.idle_timeout {
            Some(limit) => match timeout(limit, lines.next_line()).await {
                Ok(line) => Ok(line?),
                Err(_) => Err(ConnectionError::IdleTimeout(limit)),
            },
            None => Ok(lines.next_line().await?),
        }
    }

    /// Applies one request; only `GET_INFOS` has a reply.
    pub fn dispatch(&self, request: Request) -> Option<Response> {
        match request {
            Request::Submit(poi) => {
                self.policy.submit(poi);
                None
            }
            Request::NotSeen(poi) => {
                self.policy.not_seen(&poi);
                None
            }
            Request::GetInfos {
                latitude,
                longitude,
            } => Some(Response::Infos(
                self.policy.infos_around(latitude, longitude),
            )),
        }
    }
}

/// Hazard report server accepting line-protocol clients over TCP
pub struct Server {
    listener: TcpListener,
    handler: ConnectionHandler,
    clients: Arc<RwLock<ClientManager>>,
    config: ServerConfig,
}

impl Server {
    /// Binds the listening socket.
    ///
    /// A `max_clients` of zero is raised to one so the worker pool and the
    /// session limit always agree.
    pub async fn bind(mut config: ServerConfig, policy: ConsensusPolicy) -> io::Result<Self> {
        if config.max_clients == 0 {
            warn!("max_clients must be at least 1, serving one client at a time");
            config.max_clients = 1;
        }
        let listener = TcpListener::bind(config.address()).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let clients = Arc::new(RwLock::new(ClientManager::new(config.max_clients)));
        let handler = ConnectionHandler::new(policy, Arc::clone(&clients), config.idle_timeout);

        Ok(Server {
            listener,
            handler,
            clients,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn clients(&self) -> Arc<RwLock<ClientManager>> {
        Arc::clone(&self.clients)
    }

    /// Accepts and serves clients until `shutdown` completes, then closes
    /// every connection and waits for their tasks to finish.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            handler,
            clients,
            config,
        } = self;

        let semaphore = Arc::new(Semaphore::new(config.max_clients));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        let mut permit: Option<OwnedSemaphorePermit> = None;

        let mut stats_interval = interval(config.stats_interval);
        stats_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::pin!(shutdown);
        info!("Server started with up to {} concurrent clients", config.max_clients);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Server shutting down");
                    break;
                }

                // A worker slot must be free before the next accept
                acquired = Arc::clone(&semaphore).acquire_owned(), if permit.is_none() => {
                    match acquired {
                        Ok(acquired) => permit = Some(acquired),
                        Err(_) => break,
                    }
                }

                accepted = listener.accept(), if permit.is_some() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Some(slot) = permit.take() {
                                connections.spawn(serve_connection(
                                    handler.clone(),
                                    Arc::clone(&clients),
                                    stream,
                                    addr,
                                    shutdown_rx.clone(),
                                    slot,
                                ));
                            }
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }

                _ = stats_interval.tick() => {
                    let stats = clients.read().await.stats();
                    debug!(
                        "{} open connections, {} accepted, {} commands handled",
                        stats.open, stats.total_connections, stats.total_commands
                    );
                }
            }
        }

        drop(listener);
        drop(permit);
        if shutdown_tx.send(true).is_err() {
            debug!("No connection left to notify");
        }

        if !connections.is_empty() {
            info!("Waiting for {} connections to close", connections.len());
        }
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                error!("Connection task failed: {}", e);
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn serve_connection(
    handler: ConnectionHandler,
    clients: Arc<RwLock<ClientManager>>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
    _permit: OwnedSemaphorePermit,
) {
    let session_id = match clients.write().await.add_session(addr) {
        Some(id) => id,
        None => {
            warn!("Rejecting {}: too many clients", addr);
            return;
        }
    };

    match handler.serve(stream, session_id, shutdown).await {
        Ok(()) => {}
        Err(ConnectionError::Protocol(e)) => warn!("Closing client {} ({}): {}", session_id, addr, e),
        Err(ConnectionError::IdleTimeout(limit)) => {
            info!("Closing client {} ({}): idle for {:?}", session_id, addr, limit)
        }
        Err(ConnectionError::Io(e)) => error!("Client {} ({}) I/O error: {}", session_id, addr, e),
    }

    clients.write().await.remove_session(session_id);
}
