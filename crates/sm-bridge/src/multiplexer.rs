//! Routes protocol messages between client sockets and the session registry.
//!
//! Each registered client gets an outbound message queue and an event
//! forwarder task. The forwarder is the only writer of session traffic for
//! that client, so `connected`, `data` and `disconnected` for one session
//! reach the socket in the order the registry produced them.
//!
//! Ownership is kept in two maps: `clients` (client → owned sessions) and
//! `owners` (session → client). A session is claimed when its `Opened`
//! event reaches the forwarder and released when its `Closed` event does;
//! the release decides who emits `disconnected`, so it goes out exactly once.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use sm_core::config::Config;
use sm_core::error::ErrorCode;
use sm_core::types::{ClientId, SessionId};
use sm_harness::rate_limiter::ServiceLimits;
use sm_session::registry::{EventSink, SessionError, SessionRegistry};
use sm_session::session::SessionEvent;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{connect_target, ClientMessage, ProtocolError, ServerMessage};

#[derive(Debug, Clone)]
pub struct MuxSettings {
    /// Capacity of each client's outbound queue.
    pub outbound_buffer: usize,
    /// Capacity of each client's session event channel.
    pub event_buffer: usize,
}

impl MuxSettings {
    pub fn from_config(config: &Config) -> Self {
        let outbound_buffer = config.server.outbound_buffer.max(1);
        Self {
            outbound_buffer,
            event_buffer: outbound_buffer,
        }
    }
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MuxStats {
    pub clients: usize,
    pub owned_sessions: usize,
}

/// A registered client. The socket writer drains `outbound`.
pub struct ClientConnection {
    pub id: ClientId,
    pub outbound: mpsc::Receiver<ServerMessage>,
}

struct ClientEntry {
    principal: String,
    outbound: mpsc::Sender<ServerMessage>,
    events: EventSink,
    sessions: HashSet<SessionId>,
}

struct MuxInner {
    registry: SessionRegistry,
    limits: Arc<ServiceLimits>,
    settings: MuxSettings,
    clients: DashMap<ClientId, ClientEntry>,
    owners: DashMap<SessionId, ClientId>,
}

impl MuxInner {
    /// Record `session` as owned by `client`. Fails once the client is gone.
    fn claim(&self, client: ClientId, session: SessionId) -> bool {
        match self.clients.get_mut(&client) {
            Some(mut entry) => {
                entry.sessions.insert(session);
                self.owners.insert(session, client);
                true
            }
            None => false,
        }
    }

    /// Drop the ownership record. Only the first caller gets `true`.
    fn release(&self, client: ClientId, session: SessionId) -> bool {
        if let Some(mut entry) = self.clients.get_mut(&client) {
            entry.sessions.remove(&session);
        }
        self.owners
            .remove_if(&session, |_, owner| *owner == client)
            .is_some()
    }
}

#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    pub fn new(registry: SessionRegistry, limits: Arc<ServiceLimits>, settings: MuxSettings) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                registry,
                limits,
                settings,
                clients: DashMap::new(),
                owners: DashMap::new(),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Register a new client socket for `principal` and start its forwarder.
    pub fn register_client(&self, principal: impl Into<String>) -> ClientConnection {
        let id = ClientId::new();
        let principal = principal.into();
        let (out_tx, out_rx) = mpsc::channel(self.inner.settings.outbound_buffer);
        let (ev_tx, ev_rx) = mpsc::channel(self.inner.settings.event_buffer);

        self.inner.clients.insert(
            id,
            ClientEntry {
                principal: principal.clone(),
                outbound: out_tx.clone(),
                events: ev_tx,
                sessions: HashSet::new(),
            },
        );
        tokio::spawn(forward_events(self.inner.clone(), id, ev_rx, out_tx));
        debug!(client_id = %id, %principal, "client registered");

        ClientConnection {
            id,
            outbound: out_rx,
        }
    }

    pub fn principal_of(&self, client: ClientId) -> Option<String> {
        self.inner.clients.get(&client).map(|c| c.principal.clone())
    }

    pub fn owner_of(&self, session: SessionId) -> Option<ClientId> {
        self.inner.owners.get(&session).map(|o| *o)
    }

    pub fn sessions_of(&self, client: ClientId) -> Vec<SessionId> {
        self.inner
            .clients
            .get(&client)
            .map(|c| c.sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Queue a message for a client. Silently dropped if the client is gone.
    pub async fn send(&self, client: ClientId, msg: ServerMessage) {
        let tx = self.inner.clients.get(&client).map(|c| c.outbound.clone());
        if let Some(tx) = tx {
            let _ = tx.send(msg).await;
        }
    }

    /// Decode one text frame and act on it.
    pub async fn handle_frame(&self, client: ClientId, text: &str) {
        match ClientMessage::decode(text) {
            Ok(msg) => self.handle_message(client, msg).await,
            Err(e) => self.reject(client, e).await,
        }
    }

    /// Answer an undecodable frame. The socket stays open.
    pub async fn reject(&self, client: ClientId, err: ProtocolError) {
        debug!(client_id = %client, error = %err, "rejected frame");
        self.send(client, ServerMessage::error(err.session_id(), &err)).await;
    }

    pub async fn handle_message(&self, client: ClientId, msg: ClientMessage) {
        match msg {
            ClientMessage::Connect {
                host,
                port,
                username,
                credential,
            } => {
                let Some((principal, sink)) = self
                    .inner
                    .clients
                    .get(&client)
                    .map(|c| (c.principal.clone(), c.events.clone()))
                else {
                    return;
                };
                if let Err(e) = self.inner.limits.check_connect(&principal) {
                    warn!(client_id = %client, %principal, "connect rate limited");
                    let msg = ServerMessage::Error {
                        session_id: None,
                        code: ErrorCode::RateLimited,
                        message: e.to_string(),
                    };
                    self.send(client, msg).await;
                    return;
                }
                let target = match connect_target(&host, port, &username) {
                    Ok(t) => t,
                    Err(e) => return self.reject(client, e).await,
                };

                // Handshakes can take seconds; keep the receive loop free.
                let mux = self.clone();
                tokio::spawn(async move {
                    let registry = mux.inner.registry.clone();
                    match registry
                        .create_session(target.clone(), &credential, client, sink)
                        .await
                    {
                        Ok(session_id) => {
                            debug!(client_id = %client, %session_id, %target, "connect complete");
                        }
                        Err(SessionError::ClientGone) => {
                            debug!(client_id = %client, %target, "client left during connect");
                        }
                        Err(e) => {
                            warn!(client_id = %client, %target, error = %e, "connect failed");
                            mux.send(client, ServerMessage::error(None, &e)).await;
                        }
                    }
                });
            }

            ClientMessage::Data { session_id, data } => {
                let result = match self.check_owner(client, session_id) {
                    Ok(()) => {
                        self.inner
                            .registry
                            .send_input(session_id, data.into_bytes())
                            .await
                    }
                    Err(e) => Err(e),
                };
                self.report(client, session_id, result).await;
            }

            ClientMessage::Resize {
                session_id,
                cols,
                rows,
            } => {
                let result = match self.check_owner(client, session_id) {
                    Ok(()) => self.inner.registry.resize(session_id, cols, rows).await,
                    Err(e) => Err(e),
                };
                self.report(client, session_id, result).await;
            }

            ClientMessage::Disconnect { session_id } => {
                if let Err(e) = self.check_owner(client, session_id) {
                    return self.report(client, session_id, Err(e)).await;
                }
                // The forwarder emits `disconnected` once the session is Closed.
                let mux = self.clone();
                tokio::spawn(async move {
                    let result = mux.inner.registry.close_session(session_id).await;
                    mux.report(client, session_id, result).await;
                });
            }

            ClientMessage::Ping { session_id } => {
                let result = self
                    .check_owner(client, session_id)
                    .and_then(|()| self.inner.registry.touch(session_id));
                match result {
                    Ok(()) => self.send(client, ServerMessage::Pong { session_id }).await,
                    Err(e) => self.report(client, session_id, Err(e)).await,
                }
            }
        }
    }

    fn check_owner(&self, client: ClientId, session: SessionId) -> Result<(), SessionError> {
        match self.owner_of(session) {
            Some(owner) if owner == client => Ok(()),
            _ => Err(SessionError::NotFound(session)),
        }
    }

    async fn report(&self, client: ClientId, session: SessionId, result: Result<(), SessionError>) {
        if let Err(e) = result {
            debug!(client_id = %client, session_id = %session, error = %e, "request failed");
            self.send(client, ServerMessage::error(Some(session), &e)).await;
        }
    }

    /// Tear down a client: new sessions can no longer attach to it, and
    /// every session it owns is closed. Returns how many sessions it owned.
    pub async fn close_client(&self, client: ClientId) -> usize {
        let Some((_, entry)) = self.inner.clients.remove(&client) else {
            return 0;
        };
        let sessions: Vec<SessionId> = entry.sessions.iter().copied().collect();
        drop(entry);

        let registry = &self.inner.registry;
        join_all(sessions.iter().map(|id| registry.close_session(*id))).await;
        info!(client_id = %client, sessions = sessions.len(), "client closed");
        sessions.len()
    }

    /// Close every client. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let clients: Vec<ClientId> = self.inner.clients.iter().map(|c| *c.key()).collect();
        let closed = join_all(clients.into_iter().map(|c| self.close_client(c))).await;
        closed.into_iter().sum()
    }

    pub fn stats(&self) -> MuxStats {
        MuxStats {
            clients: self.inner.clients.len(),
            owned_sessions: self.inner.owners.len(),
        }
    }
}

async fn forward_events(
    inner: Arc<MuxInner>,
    client: ClientId,
    mut events: mpsc::Receiver<SessionEvent>,
    outbound: mpsc::Sender<ServerMessage>,
) {
    while let Some(event) = events.recv().await {
        let msg = match event {
            SessionEvent::Opened { session_id } => {
                if inner.claim(client, session_id) {
                    ServerMessage::Connected { session_id }
                } else {
                    // The client closed while this session was connecting.
                    debug!(client_id = %client, %session_id, "closing orphaned session");
                    let registry = inner.registry.clone();
                    tokio::spawn(async move {
                        let _ = registry.close_session(session_id).await;
                    });
                    continue;
                }
            }
            SessionEvent::Output { session_id, data } => ServerMessage::Data { session_id, data },
            SessionEvent::Closed { session_id, reason } => {
                if !inner.release(client, session_id) {
                    continue;
                }
                if let Some((code, message)) = reason.as_error() {
                    let err = ServerMessage::Error {
                        session_id: Some(session_id),
                        code,
                        message: message.to_string(),
                    };
                    let _ = outbound.send(err).await;
                }
                ServerMessage::Disconnected { session_id }
            }
        };
        // A send error only means the socket is gone; keep draining so
        // session tasks never block on this client.
        let _ = outbound.send(msg).await;
    }
    debug!(client_id = %client, "event forwarder finished");
}
