// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The server orchestrator: one task that owns the store, one agent per
//! connected client, and the subscription index that drives broadcast
//! fan-out. Because a single task serializes all commits, the store's
//! compare-and-swap sees a consistent version without any locking.

use crate::error::OtError;
use crate::ot_type::TypeRegistry;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::store::{DocStore, MemoryStore, StoredOp};
use crate::submit::{submit_op, SubmitOptions};
use crate::transport::{self, ClientTransport};
use crate::types::{Op, Snapshot};
use derive_more::{Deref, Display};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Identity the server assigns to a connection at handshake time; becomes
/// `src` on every op the client submits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Deref)]
pub struct ClientId(String);

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    loop {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Per-connected-client session state.
struct Agent {
    id: ClientId,
    outbound: mpsc::Sender<ServerMessage>,
    /// What this client is subscribed to, for cleanup on disconnect.
    subscriptions: HashMap<String, HashSet<String>>,
}

enum BackendMessage {
    Accept {
        reply: oneshot::Sender<ClientTransport>,
    },
    Incoming {
        client: ClientId,
        message: ClientMessage,
    },
    Disconnected {
        client: ClientId,
    },
    GetSnapshot {
        collection: String,
        id: String,
        reply: oneshot::Sender<Result<Snapshot, OtError>>,
    },
    GetOps {
        collection: String,
        id: String,
        reply: oneshot::Sender<Result<Vec<StoredOp>, OtError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct BackendActor {
    registry: TypeRegistry,
    store: MemoryStore,
    messages: mpsc::Receiver<BackendMessage>,
    message_tx: mpsc::Sender<BackendMessage>,
    agents: HashMap<ClientId, Agent>,
    /// collection → id → subscribed agents.
    subscriptions: HashMap<String, HashMap<String, HashSet<ClientId>>>,
    agents_created: u64,
}

impl BackendActor {
    async fn run(mut self) {
        while let Some(message) = self.messages.recv().await {
            match message {
                BackendMessage::Accept { reply } => self.accept(reply).await,
                BackendMessage::Incoming { client, message } => {
                    self.handle_client_message(client, message).await;
                }
                BackendMessage::Disconnected { client } => self.remove_agent(&client),
                BackendMessage::GetSnapshot {
                    collection,
                    id,
                    reply,
                } => {
                    let _ = reply.send(self.store.get_snapshot(&collection, &id).await);
                }
                BackendMessage::GetOps {
                    collection,
                    id,
                    reply,
                } => {
                    let _ = reply.send(self.store.get_ops(&collection, &id, 0, None).await);
                }
                BackendMessage::Close { reply } => {
                    info!(agents = self.agents.len(), "closing backend");
                    self.agents.clear();
                    self.subscriptions.clear();
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    async fn accept(&mut self, reply: oneshot::Sender<ClientTransport>) {
        self.agents_created += 1;
        let id = ClientId(base36(self.agents_created));
        let (client_transport, server_transport) = transport::pair();

        let agent = Agent {
            id: id.clone(),
            outbound: server_transport.outbound,
            subscriptions: HashMap::new(),
        };
        let handshake = ServerMessage::Handshake { id: id.to_string() };
        if agent.outbound.send(handshake).await.is_err() {
            warn!(client = %id, "client went away before the handshake");
            return;
        }
        self.agents.insert(id.clone(), agent);

        // Forward everything this client sends into the backend's mailbox.
        let message_tx = self.message_tx.clone();
        let mut inbound = server_transport.inbound;
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if message_tx
                    .send(BackendMessage::Incoming {
                        client: id.clone(),
                        message,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = message_tx.send(BackendMessage::Disconnected { client: id }).await;
        });

        let _ = reply.send(client_transport);
    }

    fn remove_agent(&mut self, client: &ClientId) {
        let Some(agent) = self.agents.remove(client) else {
            return;
        };
        debug!(client = %agent.id, "agent disconnected");
        for (collection, ids) in agent.subscriptions {
            for id in ids {
                self.unsubscribe_index(&collection, &id, client);
            }
        }
    }

    fn subscribe_index(&mut self, collection: &str, id: &str, client: &ClientId) {
        self.subscriptions
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default()
            .insert(client.clone());
    }

    fn unsubscribe_index(&mut self, collection: &str, id: &str, client: &ClientId) {
        let Some(docs) = self.subscriptions.get_mut(collection) else {
            return;
        };
        if let Some(subscribers) = docs.get_mut(id) {
            subscribers.remove(client);
            if subscribers.is_empty() {
                docs.remove(id);
            }
        }
        if docs.is_empty() {
            self.subscriptions.remove(collection);
        }
    }

    async fn send_to(&self, client: &ClientId, message: ServerMessage) {
        if let Some(agent) = self.agents.get(client) {
            if agent.outbound.send(message).await.is_err() {
                // The forwarder task will report the disconnect shortly.
                debug!(client = %client, "failed to send, client is gone");
            }
        }
    }

    /// Deliver `message` to every agent subscribed to the doc, except the
    /// one the op came from.
    async fn broadcast(
        &self,
        collection: &str,
        id: &str,
        message: ServerMessage,
        except: &ClientId,
    ) {
        let Some(subscribers) = self
            .subscriptions
            .get(collection)
            .and_then(|docs| docs.get(id))
        else {
            return;
        };
        for client in subscribers {
            if client != except {
                self.send_to(client, message.clone()).await;
            }
        }
    }

    async fn handle_client_message(&mut self, client: ClientId, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe { c, d } => {
                let reply = match self.store.get_snapshot(&c, &d).await {
                    Ok(snapshot) => {
                        self.subscribe_index(&c, &d, &client);
                        if let Some(agent) = self.agents.get_mut(&client) {
                            agent
                                .subscriptions
                                .entry(c.clone())
                                .or_default()
                                .insert(d.clone());
                        }
                        ServerMessage::Subscribe {
                            c,
                            d,
                            data: Some(snapshot),
                            error: None,
                        }
                    }
                    Err(error) => ServerMessage::Subscribe {
                        c,
                        d,
                        data: None,
                        error: Some(error.envelope()),
                    },
                };
                self.send_to(&client, reply).await;
            }
            ClientMessage::Unsubscribe { c, d } => {
                self.unsubscribe_index(&c, &d, &client);
                if let Some(agent) = self.agents.get_mut(&client) {
                    if let Some(ids) = agent.subscriptions.get_mut(&c) {
                        ids.remove(&d);
                        if ids.is_empty() {
                            agent.subscriptions.remove(&c);
                        }
                    }
                }
                let reply = ServerMessage::Unsubscribe { c, d, error: None };
                self.send_to(&client, reply).await;
            }
            ClientMessage::Fetch { c, d } => {
                let reply = match self.store.get_snapshot(&c, &d).await {
                    Ok(snapshot) => ServerMessage::Fetch {
                        c,
                        d,
                        data: Some(snapshot),
                        error: None,
                    },
                    Err(error) => ServerMessage::Fetch {
                        c,
                        d,
                        data: None,
                        error: Some(error.envelope()),
                    },
                };
                self.send_to(&client, reply).await;
            }
            ClientMessage::Op { c, d, mut op } => {
                // The connection's identity is authoritative, whatever the
                // client put in the op.
                op.src = Some(client.to_string());
                let seq = op.seq;

                match submit_op(
                    &mut self.store,
                    &self.registry,
                    &c,
                    &d,
                    &op,
                    SubmitOptions::default(),
                )
                .await
                {
                    Ok(result) => {
                        let ack = ServerMessage::Op {
                            c: c.clone(),
                            d: d.clone(),
                            op: Op {
                                body: None,
                                v: Some(result.snapshot.v),
                                src: Some(client.to_string()),
                                seq,
                            },
                            error: None,
                        };
                        self.send_to(&client, ack).await;

                        let broadcast = ServerMessage::Op {
                            c: c.clone(),
                            d: d.clone(),
                            op: result.op,
                            error: None,
                        };
                        self.broadcast(&c, &d, broadcast, &client).await;
                    }
                    Err(error) => {
                        debug!(client = %client, code = error.code(), "rejecting op");
                        let reply = ServerMessage::Op {
                            c,
                            d,
                            op: Op {
                                body: None,
                                v: None,
                                src: Some(client.to_string()),
                                seq,
                            },
                            error: Some(error.envelope()),
                        };
                        self.send_to(&client, reply).await;
                    }
                }
            }
        }
    }
}

/// Cloneable handle to a backend task.
#[derive(Clone)]
pub struct Backend {
    messages: mpsc::Sender<BackendMessage>,
}

impl Backend {
    /// Spawn a backend with a fresh in-memory store.
    #[must_use]
    pub fn new(registry: TypeRegistry) -> Self {
        let (message_tx, message_rx) = mpsc::channel(256);
        let actor = BackendActor {
            registry,
            store: MemoryStore::new(),
            messages: message_rx,
            message_tx: message_tx.clone(),
            agents: HashMap::new(),
            subscriptions: HashMap::new(),
            agents_created: 0,
        };
        tokio::spawn(actor.run());
        Self {
            messages: message_tx,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> BackendMessage,
    ) -> Result<T, OtError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.messages
            .send(build(reply_tx))
            .await
            .map_err(|_| OtError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| OtError::ConnectionClosed)
    }

    /// Accept a new client: mints a client id, sends the handshake, and
    /// returns the transport half to hand to a
    /// [`crate::connection::Connection`].
    pub async fn accept(&self) -> Result<ClientTransport, OtError> {
        self.request(|reply| BackendMessage::Accept { reply }).await
    }

    /// The authoritative snapshot, straight from the store.
    pub async fn snapshot(&self, collection: &str, id: &str) -> Result<Snapshot, OtError> {
        self.request(|reply| BackendMessage::GetSnapshot {
            collection: collection.to_string(),
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// The full op log of a document, in commit order.
    pub async fn ops(&self, collection: &str, id: &str) -> Result<Vec<StoredOp>, OtError> {
        self.request(|reply| BackendMessage::GetOps {
            collection: collection.to_string(),
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// Tear down every agent session and stop the backend task.
    pub async fn close(&self) -> Result<(), OtError> {
        self.request(|reply| BackendMessage::Close { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::*;
    use pretty_assertions::assert_eq;

    async fn handshake(transport: &mut ClientTransport) -> String {
        match transport.inbound.recv().await {
            Some(ServerMessage::Handshake { id }) => id,
            other => panic!("expected a handshake, got {other:?}"),
        }
    }

    async fn subscribe(transport: &mut ClientTransport, c: &str, d: &str) -> Snapshot {
        transport
            .outbound
            .send(ClientMessage::Subscribe {
                c: c.into(),
                d: d.into(),
            })
            .await
            .expect("send failed");
        match transport.inbound.recv().await {
            Some(ServerMessage::Subscribe {
                data: Some(snapshot),
                error: None,
                ..
            }) => snapshot,
            other => panic!("expected a subscribe reply, got {other:?}"),
        }
    }

    #[test]
    fn client_ids_count_in_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(1), "1");
        assert_eq!(base36(10), "a");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(36 * 36 + 1), "101");
    }

    #[tokio::test]
    async fn accept_mints_incrementing_ids() {
        let backend = Backend::new(TypeRegistry::with_default_types());
        let mut first = backend.accept().await.expect("accept failed");
        let mut second = backend.accept().await.expect("accept failed");

        assert_eq!(handshake(&mut first).await, "1");
        assert_eq!(handshake(&mut second).await, "2");
    }

    #[tokio::test]
    async fn subscribe_returns_the_current_snapshot() {
        let backend = Backend::new(TypeRegistry::with_default_types());
        let mut transport = backend.accept().await.expect("accept failed");
        handshake(&mut transport).await;

        let snapshot = subscribe(&mut transport, "notes", "doc1").await;
        assert_eq!(snapshot, Snapshot::empty("doc1"));
    }

    #[tokio::test]
    async fn submit_acks_the_submitter_and_broadcasts_to_others() {
        let backend = Backend::new(TypeRegistry::with_default_types());
        let mut alice = backend.accept().await.expect("accept failed");
        let mut bob = backend.accept().await.expect("accept failed");
        let alice_id = handshake(&mut alice).await;
        handshake(&mut bob).await;
        subscribe(&mut alice, "notes", "doc1").await;
        subscribe(&mut bob, "notes", "doc1").await;

        alice
            .outbound
            .send(ClientMessage::Op {
                c: "notes".into(),
                d: "doc1".into(),
                op: counter_create(7).at(0).by(&alice_id, 1),
            })
            .await
            .expect("send failed");

        // The submitter gets an ack with the committed version and no body.
        match alice.inbound.recv().await {
            Some(ServerMessage::Op { op, error: None, .. }) => {
                assert_eq!(op.body, None);
                assert_eq!(op.v, Some(1));
                assert_eq!(op.src.as_deref(), Some(alice_id.as_str()));
                assert_eq!(op.seq, Some(1));
            }
            other => panic!("expected an ack, got {other:?}"),
        }

        // The other subscriber gets the committed op at its base version.
        match bob.inbound.recv().await {
            Some(ServerMessage::Op { op, error: None, .. }) => {
                assert!(op.body.is_some());
                assert_eq!(op.v, Some(0));
                assert_eq!(op.src.as_deref(), Some(alice_id.as_str()));
            }
            other => panic!("expected a broadcast, got {other:?}"),
        }

        let snapshot = backend.snapshot("notes", "doc1").await.expect("snapshot");
        assert_eq!(snapshot.v, 1);
        assert_eq!(snapshot.data, Some(serde_json::Value::from(7)));
    }

    #[tokio::test]
    async fn unsubscribed_clients_get_no_broadcasts() {
        let backend = Backend::new(TypeRegistry::with_default_types());
        let mut alice = backend.accept().await.expect("accept failed");
        let mut bob = backend.accept().await.expect("accept failed");
        let alice_id = handshake(&mut alice).await;
        handshake(&mut bob).await;
        subscribe(&mut alice, "notes", "doc1").await;
        subscribe(&mut bob, "notes", "doc1").await;

        bob.outbound
            .send(ClientMessage::Unsubscribe {
                c: "notes".into(),
                d: "doc1".into(),
            })
            .await
            .expect("send failed");
        assert!(matches!(
            bob.inbound.recv().await,
            Some(ServerMessage::Unsubscribe { error: None, .. })
        ));

        alice
            .outbound
            .send(ClientMessage::Op {
                c: "notes".into(),
                d: "doc1".into(),
                op: counter_create(1).at(0).by(&alice_id, 1),
            })
            .await
            .expect("send failed");
        // Alice gets her ack.
        assert!(matches!(
            alice.inbound.recv().await,
            Some(ServerMessage::Op { error: None, .. })
        ));
        // Bob's channel stays quiet.
        assert!(bob.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn a_rejected_op_reaches_only_the_submitter() {
        let backend = Backend::new(TypeRegistry::with_default_types());
        let mut alice = backend.accept().await.expect("accept failed");
        let alice_id = handshake(&mut alice).await;
        subscribe(&mut alice, "notes", "doc1").await;

        // Editing a nonexistent doc is rejected.
        alice
            .outbound
            .send(ClientMessage::Op {
                c: "notes".into(),
                d: "doc1".into(),
                op: counter_add(1).at(0).by(&alice_id, 1),
            })
            .await
            .expect("send failed");

        match alice.inbound.recv().await {
            Some(ServerMessage::Op { op, error: Some(error), .. }) => {
                assert_eq!(error.code, "DoesNotExist");
                assert_eq!(op.seq, Some(1));
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_tears_down_all_agents() {
        let backend = Backend::new(TypeRegistry::with_default_types());
        let mut transport = backend.accept().await.expect("accept failed");
        handshake(&mut transport).await;

        backend.close().await.expect("close failed");
        assert!(transport.inbound.recv().await.is_none());
    }
}
