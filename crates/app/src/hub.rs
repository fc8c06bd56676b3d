use std::collections::HashMap;

use metrics::gauge;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ServerEvent, TimerSync};

const CLIENT_BUFFER: usize = 64;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    WebSocket,
    Sse,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::WebSocket => "ws",
            Transport::Sse => "sse",
        }
    }
}

/// Server side of one connected client. The transport task owns the receiver.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub transport: Transport,
    sender: mpsc::Sender<ServerEvent>,
}

impl ClientConnection {
    pub fn new(transport: Transport) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (sender, receiver) = mpsc::channel(CLIENT_BUFFER);
        let connection = Self {
            id: Uuid::new_v4(),
            transport,
            sender,
        };
        (connection, receiver)
    }

    fn try_send(&self, event: ServerEvent) -> Result<(), TrySendError<ServerEvent>> {
        self.sender.try_send(event)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Clients removed because the send failed.
    pub dropped: Vec<ConnectionId>,
}

/// Registry of connected clients.
///
/// Sends never wait: a client whose buffer is full or whose receiver is gone
/// is dropped from the registry so it cannot hold up anyone else. A dropped
/// client reconnects and is resynchronized by [`BroadcastHub::register`].
#[derive(Debug, Default)]
pub struct BroadcastHub {
    clients: HashMap<ConnectionId, ClientConnection>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client and immediately sends it the current state.
    pub fn register(&mut self, connection: ClientConnection, state: TimerSync) -> bool {
        let id = connection.id;
        let transport = connection.transport;
        if let Err(err) = connection.try_send(ServerEvent::Sync(state)) {
            warn!(stage = "hub", %id, transport = transport.as_str(), error = %err, "initial sync failed, client not registered");
            return false;
        }
        self.clients.insert(id, connection);
        self.record_clients(transport);
        info!(stage = "hub", %id, transport = transport.as_str(), clients = self.clients.len(), "client registered");
        true
    }

    pub fn unregister(&mut self, id: ConnectionId) -> Option<ClientConnection> {
        let removed = self.clients.remove(&id)?;
        self.record_clients(removed.transport);
        info!(stage = "hub", %id, transport = removed.transport.as_str(), clients = self.clients.len(), "client unregistered");
        Some(removed)
    }

    /// Sends `event` to every registered client.
    pub fn broadcast(&mut self, event: &ServerEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let targets: Vec<ConnectionId> = self.clients.keys().copied().collect();
        let mut failed = Vec::new();

        for id in targets {
            let Some(connection) = self.clients.get(&id) else {
                continue;
            };
            match connection.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    debug!(stage = "hub", %id, event = event.name(), error = %err, "broadcast send failed");
                    failed.push(id);
                }
            }
        }

        for id in &failed {
            self.unregister(*id);
        }
        report.dropped = failed;
        report
    }

    /// Sends `event` to a single client.
    pub fn send_to(&mut self, id: ConnectionId, event: ServerEvent) -> bool {
        let Some(connection) = self.clients.get(&id) else {
            return false;
        };
        if connection.try_send(event).is_err() {
            self.unregister(id);
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    fn record_clients(&self, transport: Transport) {
        let count = self
            .clients
            .values()
            .filter(|client| client.transport == transport)
            .count();
        gauge!("hub_clients", "transport" => transport.as_str()).set(count as f64);
    }
}
