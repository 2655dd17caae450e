//! Bookkeeping for open client connections
//!
//! The protocol itself is stateless, so a session only carries what the
//! operator wants to see in the logs: who is connected, since when, and how
//! much they have sent.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// One open TCP connection
#[derive(Debug)]
pub struct Session {
    /// Identifier assigned by the server, unique for the process lifetime
    pub id: u32,
    /// Remote address of the client
    pub addr: SocketAddr,
    pub connected_at: Instant,
    /// Last time a command was received
    pub last_seen: Instant,
    /// Commands handled on this connection
    pub commands: u64,
}

impl Session {
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            connected_at: now,
            last_seen: now,
            commands: 0,
        }
    }

    /// Counts one handled command and refreshes the activity stamp
    pub fn record_command(&mut self) {
        self.last_seen = Instant::now();
        self.commands += 1;
    }
}

/// Aggregate counters reported in the periodic statistics line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub open: usize,
    pub total_connections: u64,
    pub total_commands: u64,
}

/// Tracks every open session and enforces the connection limit.
pub struct ClientManager {
    sessions: HashMap<u32, Session>,
    next_session_id: u32,
    max_clients: usize,
    total_connections: u64,
    /// Commands of sessions that already closed
    closed_commands: u64,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            max_clients,
            total_connections: 0,
            closed_commands: 0,
        }
    }

    /// Opens a session for a freshly accepted connection.
    ///
    /// Returns None when the limit is already reached.
    pub fn add_session(&mut self, addr: SocketAddr) -> Option<u32> {
        if self.sessions.len() >= self.max_clients {
            return None;
        }

        let session_id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1).max(1);
        self.total_connections += 1;

        info!("Client {} connected from {}", session_id, addr);
        self.sessions.insert(session_id, Session::new(session_id, addr));
        Some(session_id)
    }

    /// Closes a session and returns it
    pub fn remove_session(&mut self, session_id: u32) -> Option<Session> {
        let session = self.sessions.remove(&session_id)?;
        self.closed_commands += session.commands;
        info!(
            "Client {} ({}) disconnected after {:.1}s, {} commands",
            session.id,
            session.addr,
            session.connected_at.elapsed().as_secs_f64(),
            session.commands
        );
        Some(session)
    }

    /// Counts a command handled on an open session.
    ///
    /// Returns false when the session was already closed, in which case
    /// nothing is recorded.
    pub fn record_command(&mut self, session_id: u32) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.record_command();
                true
            }
            None => false,
        }
    }

    /// Looks up an open session by id
    pub fn get(&self, session_id: u32) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            open: self.sessions.len(),
            total_connections: self.total_connections,
            total_commands: self.closed_commands
                + self.sessions.values().map(|s| s.commands).sum::<u64>(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
