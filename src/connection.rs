// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The client connection: one task that owns all doc replicas for a
//! transport, routes server messages to them, and enforces the flush
//! discipline (at most one op in flight per doc, `seq` handed out exactly
//! once per transmitted op).

use crate::doc::{ControlReply, Doc, DocEvent, LocalState, SubmitReply};
use crate::error::{ErrorEnvelope, OtError};
use crate::ot_type::TypeRegistry;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::ClientTransport;
use crate::types::{CreatePayload, Op, OpBody, Snapshot};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

type DocKey = (String, String);
type FetchReply = oneshot::Sender<Result<Snapshot, OtError>>;

pub enum ConnectionCommand {
    WaitConnected {
        reply: ControlReply,
    },
    Subscribe {
        collection: String,
        id: String,
        reply: ControlReply,
    },
    Unsubscribe {
        collection: String,
        id: String,
        reply: ControlReply,
    },
    Fetch {
        collection: String,
        id: String,
        reply: FetchReply,
    },
    Submit {
        collection: String,
        id: String,
        body: OpBody,
        reply: SubmitReply,
    },
    State {
        collection: String,
        id: String,
        reply: oneshot::Sender<LocalState>,
    },
    Events {
        collection: String,
        id: String,
        reply: oneshot::Sender<broadcast::Receiver<DocEvent>>,
    },
    Reconnect {
        transport: ClientTransport,
        reply: ControlReply,
    },
}

struct ConnectionActor {
    registry: TypeRegistry,
    client_id: Option<String>,
    seq: u64,
    docs: BTreeMap<DocKey, Doc>,
    outbound: Option<mpsc::Sender<ClientMessage>>,
    inbound: Option<mpsc::Receiver<ServerMessage>>,
    commands: mpsc::Receiver<ConnectionCommand>,
    /// Subscribe requests sent but not yet answered, so a flush round does
    /// not send them twice.
    subscribes_sent: BTreeSet<DocKey>,
    fetch_waiters: BTreeMap<DocKey, Vec<FetchReply>>,
    connect_waiters: Vec<ControlReply>,
}

impl ConnectionActor {
    fn new(
        registry: TypeRegistry,
        transport: ClientTransport,
        commands: mpsc::Receiver<ConnectionCommand>,
    ) -> Self {
        Self {
            registry,
            client_id: None,
            seq: 0,
            docs: BTreeMap::new(),
            outbound: Some(transport.outbound),
            inbound: Some(transport.inbound),
            commands,
            subscribes_sent: BTreeSet::new(),
            fetch_waiters: BTreeMap::new(),
            connect_waiters: Vec::new(),
        }
    }

    async fn run(mut self) {
        loop {
            if let Some(mut inbound) = self.inbound.take() {
                tokio::select! {
                    command = self.commands.recv() => {
                        self.inbound = Some(inbound);
                        let Some(command) = command else {
                            debug!("all connection handles dropped, stopping");
                            break;
                        };
                        self.handle_command(command).await;
                    }
                    message = inbound.recv() => {
                        match message {
                            Some(message) => {
                                self.inbound = Some(inbound);
                                self.handle_server_message(message).await;
                            }
                            None => self.handle_disconnect(),
                        }
                    }
                }
            } else {
                let Some(command) = self.commands.recv().await else {
                    debug!("all connection handles dropped, stopping");
                    break;
                };
                self.handle_command(command).await;
            }
        }
    }

    fn doc_mut(&mut self, collection: &str, id: &str) -> &mut Doc {
        let key = (collection.to_string(), id.to_string());
        let registry = self.registry.clone();
        self.docs
            .entry(key)
            .or_insert_with(|| Doc::new(collection, id, registry))
    }

    async fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::WaitConnected { reply } => {
                if self.client_id.is_some() {
                    let _ = reply.send(Ok(()));
                } else {
                    self.connect_waiters.push(reply);
                }
            }
            ConnectionCommand::Subscribe {
                collection,
                id,
                reply,
            } => {
                self.doc_mut(&collection, &id)
                    .mark_subscribe_requested(Some(reply));
                self.send_subscribes().await;
            }
            ConnectionCommand::Unsubscribe {
                collection,
                id,
                reply,
            } => {
                if self.client_id.is_some() {
                    self.doc_mut(&collection, &id).mark_unsubscribe_requested(reply);
                    self.send(ClientMessage::Unsubscribe { c: collection, d: id })
                        .await;
                } else {
                    let doc = self.doc_mut(&collection, &id);
                    doc.mark_unsubscribe_requested(reply);
                    doc.handle_unsubscribe_reply(None);
                }
            }
            ConnectionCommand::Fetch {
                collection,
                id,
                reply,
            } => {
                if self.client_id.is_none() {
                    let _ = reply.send(Err(OtError::ConnectionClosed));
                    return;
                }
                self.fetch_waiters
                    .entry((collection.clone(), id.clone()))
                    .or_default()
                    .push(reply);
                self.send(ClientMessage::Fetch { c: collection, d: id }).await;
            }
            ConnectionCommand::Submit {
                collection,
                id,
                body,
                reply,
            } => {
                self.doc_mut(&collection, &id).submit(body, reply);
                self.flush().await;
            }
            ConnectionCommand::State {
                collection,
                id,
                reply,
            } => {
                let _ = reply.send(self.doc_mut(&collection, &id).state());
            }
            ConnectionCommand::Events {
                collection,
                id,
                reply,
            } => {
                let _ = reply.send(self.doc_mut(&collection, &id).events());
            }
            ConnectionCommand::Reconnect { transport, reply } => {
                self.handle_disconnect();
                self.outbound = Some(transport.outbound);
                self.inbound = Some(transport.inbound);
                self.connect_waiters.push(reply);
            }
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Handshake { id } => {
                info!(client_id = %id, "connected");
                self.client_id = Some(id);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.send_subscribes().await;
                self.flush().await;
            }
            ServerMessage::Subscribe { c, d, data, error } => {
                self.subscribes_sent.remove(&(c.clone(), d.clone()));
                self.doc_mut(&c, &d).handle_subscribe_reply(data, error);
                self.flush().await;
            }
            ServerMessage::Unsubscribe { c, d, error } => {
                self.doc_mut(&c, &d).handle_unsubscribe_reply(error);
            }
            ServerMessage::Fetch { c, d, data, error } => {
                let waiters = self.fetch_waiters.remove(&(c, d)).unwrap_or_default();
                for waiter in waiters {
                    let result = match (&data, &error) {
                        (_, Some(error)) => Err(OtError::Server(error.clone())),
                        (Some(snapshot), None) => Ok(snapshot.clone()),
                        (None, None) => Err(OtError::BadlyFormed(
                            "fetch reply carried neither data nor error".to_string(),
                        )),
                    };
                    let _ = waiter.send(result);
                }
            }
            ServerMessage::Op { c, d, op, error } => {
                self.handle_op_message(&c, &d, op, error).await;
            }
        }
    }

    async fn handle_op_message(
        &mut self,
        collection: &str,
        id: &str,
        op: Op,
        error: Option<ErrorEnvelope>,
    ) {
        let ours = op.src.is_some() && op.src == self.client_id;
        let doc = self.doc_mut(collection, id);

        if let Some(error) = error {
            if ours && op.seq == doc.inflight_seq() {
                warn!(collection, id, code = %error.code, "server rejected our op");
                doc.hard_rollback(&error);
                self.send_subscribes().await;
            } else {
                warn!(collection, id, code = %error.code, "unmatched op error");
            }
            return;
        }

        if ours {
            if op.seq == doc.inflight_seq() {
                if let Some(v) = op.v {
                    doc.handle_ack(v);
                    self.flush().await;
                }
            } else {
                debug!(collection, id, "echo of our own op, ignoring");
            }
            return;
        }

        if let Err(error) = doc.handle_remote(op) {
            warn!(collection, id, code = error.code(), "remote op broke the pipeline");
            doc.hard_rollback(&error.envelope());
            self.send_subscribes().await;
        }
    }

    fn handle_disconnect(&mut self) {
        if self.client_id.take().is_some() || self.outbound.is_some() {
            info!("disconnected");
        }
        self.inbound = None;
        self.outbound = None;
        self.subscribes_sent.clear();
        for doc in self.docs.values_mut() {
            doc.connection_closed();
        }
    }

    async fn send(&mut self, message: ClientMessage) {
        let Some(outbound) = self.outbound.clone() else {
            return;
        };
        if outbound.send(message).await.is_err() {
            self.handle_disconnect();
        }
    }

    /// Send subscribe requests for every doc that wants one. Gated on the
    /// handshake, so early subscribes queue until we are connected.
    async fn send_subscribes(&mut self) {
        if self.client_id.is_none() {
            return;
        }
        let mut to_send = Vec::new();
        for (key, doc) in &self.docs {
            if doc.wants_subscribe() && !self.subscribes_sent.contains(key) {
                to_send.push(key.clone());
            }
        }
        for key in to_send {
            self.subscribes_sent.insert(key.clone());
            self.send(ClientMessage::Subscribe { c: key.0, d: key.1 }).await;
        }
    }

    /// Move one op per idle doc into flight. `seq` is incremented exactly
    /// once per transmitted op.
    async fn flush(&mut self) {
        let Some(client_id) = self.client_id.clone() else {
            return;
        };
        let mut to_send = Vec::new();
        for ((collection, id), doc) in &mut self.docs {
            if !doc.needs_flush() {
                continue;
            }
            self.seq += 1;
            if let Some(mut op) = doc.take_next_for_flight(self.seq) {
                op.src = Some(client_id.clone());
                to_send.push(ClientMessage::Op {
                    c: collection.clone(),
                    d: id.clone(),
                    op,
                });
            }
        }
        for message in to_send {
            self.send(message).await;
        }
    }
}

/// Cloneable handle to a connection task. All doc access goes through
/// here; replies travel back over oneshot channels.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::Sender<ConnectionCommand>,
}

impl Connection {
    /// Spawn the connection task on the given transport. The server's
    /// handshake completes the connection; ops submitted before that queue
    /// up and flush afterwards.
    #[must_use]
    pub fn connect(transport: ClientTransport, registry: TypeRegistry) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let actor = ConnectionActor::new(registry, transport, command_rx);
        tokio::spawn(actor.run());
        Self {
            commands: command_tx,
        }
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ConnectionCommand,
    ) -> Result<T, OtError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| OtError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| OtError::ConnectionClosed)
    }

    /// Resolves once the server's handshake has been processed.
    pub async fn wait_connected(&self) -> Result<(), OtError> {
        self.command(|reply| ConnectionCommand::WaitConnected { reply })
            .await?
    }

    pub async fn subscribe(&self, collection: &str, id: &str) -> Result<(), OtError> {
        self.command(|reply| ConnectionCommand::Subscribe {
            collection: collection.to_string(),
            id: id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn unsubscribe(&self, collection: &str, id: &str) -> Result<(), OtError> {
        self.command(|reply| ConnectionCommand::Unsubscribe {
            collection: collection.to_string(),
            id: id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn fetch(&self, collection: &str, id: &str) -> Result<Snapshot, OtError> {
        self.command(|reply| ConnectionCommand::Fetch {
            collection: collection.to_string(),
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// Create the document. Resolves with the server-acknowledged version.
    pub async fn create(
        &self,
        collection: &str,
        id: &str,
        kind: &str,
        data: Option<Value>,
    ) -> Result<u64, OtError> {
        self.submit_body(
            collection,
            id,
            OpBody::Create(CreatePayload {
                kind: kind.to_string(),
                data,
            }),
        )
        .await
    }

    /// Submit an edit. Resolves with the server-acknowledged version.
    pub async fn submit(
        &self,
        collection: &str,
        id: &str,
        payload: Value,
    ) -> Result<u64, OtError> {
        self.submit_body(collection, id, OpBody::Edit(payload)).await
    }

    /// Delete the document. Resolves with the server-acknowledged version.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<u64, OtError> {
        self.submit_body(collection, id, OpBody::Del(true)).await
    }

    async fn submit_body(
        &self,
        collection: &str,
        id: &str,
        body: OpBody,
    ) -> Result<u64, OtError> {
        self.command(|reply| ConnectionCommand::Submit {
            collection: collection.to_string(),
            id: id.to_string(),
            body,
            reply,
        })
        .await?
    }

    pub async fn state(&self, collection: &str, id: &str) -> Result<LocalState, OtError> {
        self.command(|reply| ConnectionCommand::State {
            collection: collection.to_string(),
            id: id.to_string(),
            reply,
        })
        .await
    }

    pub async fn events(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<broadcast::Receiver<DocEvent>, OtError> {
        self.command(|reply| ConnectionCommand::Events {
            collection: collection.to_string(),
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Swap in a fresh transport after a disconnect. Resolves once the new
    /// handshake has been processed; subscribed docs resubscribe and
    /// unacknowledged ops are resent.
    pub async fn reconnect(&self, transport: ClientTransport) -> Result<(), OtError> {
        self.command(|reply| ConnectionCommand::Reconnect { transport, reply })
            .await?
    }
}
