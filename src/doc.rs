// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The client-side replica of one document: optimistic local state, at most
//! one operation in flight, and a queue of pending operations that get
//! rebased whenever a remote op arrives.
//!
//! Everything here is synchronous and only *calculates*; the connection
//! owns the replica and does the actual sending. That keeps this state
//! machine testable without a transport.

use crate::error::{ErrorEnvelope, OtError};
use crate::ot_type::{OtType, TypeRegistry};
use crate::types::{Op, OpBody, Side, Snapshot};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

pub type SubmitReply = oneshot::Sender<Result<u64, OtError>>;
pub type ControlReply = oneshot::Sender<Result<(), OtError>>;

/// A locally submitted op that has not been acknowledged yet.
#[derive(Debug)]
pub struct PendingOp {
    pub body: OpBody,
    /// The base version; kept equal to the doc's version while queued.
    pub v: u64,
    /// Assigned by the connection when the op goes into flight.
    pub seq: Option<u64>,
    reply: Option<SubmitReply>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSource {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub enum DocEvent {
    /// A snapshot was ingested after subscribing.
    Load,
    Create { source: OpSource },
    Op { body: OpBody, source: OpSource },
    Del { source: OpSource },
    Ack { v: u64 },
    Error { error: ErrorEnvelope },
}

/// A copy of the replica's observable state, for callers outside the
/// connection task.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalState {
    pub version: u64,
    pub kind: Option<String>,
    pub data: Option<Value>,
    pub subscribed: bool,
}

pub struct Doc {
    pub collection: String,
    pub id: String,
    registry: TypeRegistry,
    /// The last server-acknowledged version. Optimistic local ops do not
    /// advance it.
    version: u64,
    kind: Option<Arc<dyn OtType>>,
    data: Option<Value>,
    subscribed: bool,
    /// Whether the connection should (re)subscribe this doc next time it
    /// is able to send.
    wants_subscribe: bool,
    inflight: Option<PendingOp>,
    pending: VecDeque<PendingOp>,
    events: broadcast::Sender<DocEvent>,
    subscribe_waiters: Vec<ControlReply>,
    unsubscribe_waiters: Vec<ControlReply>,
}

impl Doc {
    #[must_use]
    pub fn new(collection: &str, id: &str, registry: TypeRegistry) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            registry,
            version: 0,
            kind: None,
            data: None,
            subscribed: false,
            wants_subscribe: false,
            inflight: None,
            pending: VecDeque::new(),
            events,
            subscribe_waiters: Vec::new(),
            unsubscribe_waiters: Vec::new(),
        }
    }

    pub fn state(&self) -> LocalState {
        LocalState {
            version: self.version,
            kind: self.kind.as_ref().map(|t| t.uri().to_string()),
            data: self.data.clone(),
            subscribed: self.subscribed,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<DocEvent> {
        self.events.subscribe()
    }

    pub fn wants_subscribe(&self) -> bool {
        self.wants_subscribe && !self.subscribed
    }

    pub fn mark_subscribe_requested(&mut self, reply: Option<ControlReply>) {
        self.wants_subscribe = true;
        if let Some(reply) = reply {
            self.subscribe_waiters.push(reply);
        }
    }

    pub fn mark_unsubscribe_requested(&mut self, reply: ControlReply) {
        self.wants_subscribe = false;
        self.unsubscribe_waiters.push(reply);
    }

    /// Submit a local op: apply it optimistically and queue it for the
    /// server. Local precondition failures answer the caller right away.
    /// Returns whether anything new is waiting to be flushed.
    pub fn submit(&mut self, body: OpBody, reply: SubmitReply) -> bool {
        if let Err(error) = self.ot_apply(&body, OpSource::Local) {
            let _ = reply.send(Err(error));
            return false;
        }
        self.pending.push_back(PendingOp {
            body,
            v: self.version,
            seq: None,
            reply: Some(reply),
        });
        true
    }

    pub fn needs_flush(&self) -> bool {
        self.inflight.is_none() && !self.pending.is_empty()
    }

    /// Move the head of the pending queue into flight, stamping it with
    /// the connection's next sequence number. Returns the wire op; the
    /// connection fills in `src`.
    pub fn take_next_for_flight(&mut self, seq: u64) -> Option<Op> {
        if self.inflight.is_some() {
            return None;
        }
        let mut next = self.pending.pop_front()?;
        next.seq = Some(seq);
        next.v = self.version;
        let op = Op {
            body: Some(next.body.clone()),
            v: Some(next.v),
            src: None,
            seq: Some(seq),
        };
        self.inflight = Some(next);
        Some(op)
    }

    pub fn inflight_seq(&self) -> Option<u64> {
        self.inflight.as_ref().and_then(|op| op.seq)
    }

    /// The server acknowledged the inflight op at `v`.
    pub fn handle_ack(&mut self, v: u64) {
        let Some(mut inflight) = self.inflight.take() else {
            warn!(doc = %self.id, "got an ack but nothing is in flight");
            return;
        };
        self.version = v;
        for pending in &mut self.pending {
            pending.v = v;
        }
        if let Some(reply) = inflight.reply.take() {
            let _ = reply.send(Ok(v));
        }
        let _ = self.events.send(DocEvent::Ack { v });
    }

    /// The server rejected the inflight op: drop the whole pipeline, fail
    /// every dropped callback, reset to nonexistent, and ask for a
    /// resubscribe to fetch fresh truth.
    pub fn hard_rollback(&mut self, error: &ErrorEnvelope) {
        debug!(doc = %self.id, code = %error.code, "hard rollback");
        let inflight = self.inflight.take();
        for mut dropped in inflight.into_iter().chain(self.pending.drain(..)) {
            if let Some(reply) = dropped.reply.take() {
                let _ = reply.send(Err(OtError::Server(error.clone())));
            }
        }
        self.kind = None;
        self.data = None;
        self.subscribed = false;
        self.wants_subscribe = true;
        let _ = self.events.send(DocEvent::Error {
            error: error.clone(),
        });
    }

    /// An op committed by some other client arrived. Rebase the local
    /// pipeline against it, then apply it. A rebase failure means the
    /// pipeline cannot survive (the doc was deleted or created under us);
    /// the caller is expected to follow up with [`Self::hard_rollback`].
    pub fn handle_remote(&mut self, op: Op) -> Result<(), OtError> {
        let Some(v) = op.v else {
            warn!(doc = %self.id, "remote op without a version, dropping it");
            return Ok(());
        };
        if v < self.version {
            debug!(doc = %self.id, v, version = self.version, "duplicate remote op");
            return Ok(());
        }
        if v > self.version {
            warn!(
                doc = %self.id,
                v,
                version = self.version,
                "remote op from the future, dropping it"
            );
            return Ok(());
        }

        let mut remote = op;
        let kind = self.kind.clone();
        if let Some(inflight) = &mut self.inflight {
            transform_x(kind.as_ref(), inflight, &mut remote)?;
        }
        for pending in &mut self.pending {
            transform_x(kind.as_ref(), pending, &mut remote)?;
        }

        self.version += 1;
        if let Some(inflight) = &mut self.inflight {
            inflight.v = self.version;
        }
        for pending in &mut self.pending {
            pending.v = self.version;
        }

        if let Some(body) = remote.body {
            self.ot_apply(&body, OpSource::Remote)?;
        }
        Ok(())
    }

    /// A subscribe reply arrived. With an idle pipeline the snapshot
    /// becomes our state; with optimistic work queued we keep the local
    /// state and only adopt the version, letting the server arbitrate once
    /// the queue flushes.
    pub fn handle_subscribe_reply(
        &mut self,
        data: Option<Snapshot>,
        error: Option<ErrorEnvelope>,
    ) {
        if let Some(error) = error {
            for waiter in self.subscribe_waiters.drain(..) {
                let _ = waiter.send(Err(OtError::Server(error.clone())));
            }
            let _ = self.events.send(DocEvent::Error { error });
            return;
        }
        let snapshot = data.unwrap_or_else(|| Snapshot::empty(&self.id));

        if self.inflight.is_none() && self.pending.is_empty() {
            match &snapshot.kind {
                Some(kind) => match self.registry.require(kind) {
                    Ok(ot_type) => {
                        self.kind = Some(ot_type);
                        self.data = snapshot.data;
                    }
                    Err(error) => {
                        let envelope = error.envelope();
                        for waiter in self.subscribe_waiters.drain(..) {
                            let _ = waiter.send(Err(OtError::Server(envelope.clone())));
                        }
                        let _ = self.events.send(DocEvent::Error { error: envelope });
                        return;
                    }
                },
                None => {
                    self.kind = None;
                    self.data = None;
                }
            }
        }
        self.version = snapshot.v;
        if let Some(inflight) = &mut self.inflight {
            inflight.v = snapshot.v;
        }
        for pending in &mut self.pending {
            pending.v = snapshot.v;
        }

        self.subscribed = true;
        self.wants_subscribe = true;
        for waiter in self.subscribe_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        let _ = self.events.send(DocEvent::Load);
    }

    pub fn handle_unsubscribe_reply(&mut self, error: Option<ErrorEnvelope>) {
        self.subscribed = false;
        for waiter in self.unsubscribe_waiters.drain(..) {
            let _ = waiter.send(match &error {
                Some(error) => Err(OtError::Server(error.clone())),
                None => Ok(()),
            });
        }
    }

    /// The transport went away: the inflight op is returned to the head of
    /// the pending queue so it is resent, and the doc resubscribes on
    /// reconnect to receive a fresh snapshot.
    pub fn connection_closed(&mut self) {
        if let Some(mut inflight) = self.inflight.take() {
            inflight.seq = None;
            self.pending.push_front(inflight);
        }
        if self.subscribed {
            self.subscribed = false;
            self.wants_subscribe = true;
        }
    }

    fn ot_apply(&mut self, body: &OpBody, source: OpSource) -> Result<(), OtError> {
        match body {
            OpBody::Create(create) => {
                if self.kind.is_some() {
                    return Err(OtError::AlreadyCreated);
                }
                let ot_type = self.registry.require(&create.kind)?;
                self.data = Some(ot_type.create(create.data.as_ref())?);
                self.kind = Some(ot_type);
                let _ = self.events.send(DocEvent::Create { source });
            }
            OpBody::Edit(payload) => {
                let ot_type = self.kind.clone().ok_or(OtError::DoesNotExist)?;
                let data = self.data.as_ref().ok_or(OtError::DoesNotExist)?;
                self.data = Some(ot_type.apply(data, payload)?);
                let _ = self.events.send(DocEvent::Op {
                    body: body.clone(),
                    source,
                });
            }
            OpBody::Del(_) => {
                self.kind = None;
                self.data = None;
                let _ = self.events.send(DocEvent::Del { source });
            }
        }
        Ok(())
    }
}

/// Pairwise rebase of a local pending/inflight op against an incoming
/// remote op sharing the same base version. Both are rewritten: the local
/// op with `Left` priority, the remote op with `Right`, so the remote op
/// can afterwards be applied on top of the rebased local queue. A local
/// delete neutralizes the remote op instead.
fn transform_x(
    kind: Option<&Arc<dyn OtType>>,
    client: &mut PendingOp,
    server: &mut Op,
) -> Result<(), OtError> {
    if matches!(client.body, OpBody::Del(_)) {
        // Delete wins locally; later pending ops see a clean base.
        server.body = None;
        return Ok(());
    }

    let primes = match (&client.body, &server.body) {
        (_, None) => None,
        (_, Some(OpBody::Del(_))) => return Err(OtError::WasDeleted),
        (_, Some(OpBody::Create(_))) | (OpBody::Create(_), Some(OpBody::Edit(_))) => {
            return Err(OtError::AlreadyCreated)
        }
        (OpBody::Edit(client_payload), Some(OpBody::Edit(server_payload))) => {
            let ot_type = kind.ok_or(OtError::DoesNotExist)?;
            let client_prime = ot_type.transform(client_payload, server_payload, Side::Left)?;
            let server_prime = ot_type.transform(server_payload, client_payload, Side::Right)?;
            Some((client_prime, server_prime))
        }
        (OpBody::Del(_), Some(OpBody::Edit(_))) => unreachable!("handled above"),
    };

    if let Some((client_prime, server_prime)) = primes {
        client.body = OpBody::Edit(client_prime);
        server.body = Some(OpBody::Edit(server_prime));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::*;

    fn doc() -> Doc {
        Doc::new("notes", "doc1", TypeRegistry::with_default_types())
    }

    fn subscribed_text_doc(content: &str, v: u64) -> Doc {
        let mut doc = doc();
        doc.mark_subscribe_requested(None);
        doc.handle_subscribe_reply(Some(text_snapshot("doc1", v, content)), None);
        doc
    }

    fn submit(doc: &mut Doc, op: Op) -> oneshot::Receiver<Result<u64, OtError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let body = op.body.expect("test ops have a body");
        doc.submit(body, reply_tx);
        reply_rx
    }

    fn text(doc: &Doc) -> String {
        doc.state()
            .data
            .and_then(|data| data.as_str().map(ToString::to_string))
            .expect("doc should have text data")
    }

    mod submitting {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn applies_optimistically_without_advancing_the_version() {
            let mut doc = subscribed_text_doc("hello", 1);
            submit(&mut doc, text_insert(1, "X"));

            assert_eq!(text(&doc), "hXello");
            assert_eq!(doc.state().version, 1);
            assert!(doc.needs_flush());
        }

        #[test]
        fn edit_on_nonexistent_fails_immediately() {
            let mut doc = doc();
            let mut reply = submit(&mut doc, text_insert(0, "X"));
            let result = reply.try_recv().expect("reply should be immediate");
            assert_eq!(result.expect_err("should fail").code(), "DoesNotExist");
            assert!(!doc.needs_flush());
        }

        #[test]
        fn create_on_existing_fails_immediately() {
            let mut doc = subscribed_text_doc("hello", 1);
            let mut reply = submit(&mut doc, text_create("again"));
            let result = reply.try_recv().expect("reply should be immediate");
            assert_eq!(result.expect_err("should fail").code(), "AlreadyCreated");
        }

        #[test]
        fn only_one_op_goes_into_flight() {
            let mut doc = subscribed_text_doc("hello", 1);
            submit(&mut doc, text_insert(0, "a"));
            submit(&mut doc, text_insert(0, "b"));

            let first = doc.take_next_for_flight(1).expect("head should flush");
            assert_eq!(first.v, Some(1));
            assert_eq!(first.seq, Some(1));

            assert!(doc.take_next_for_flight(2).is_none());
            assert!(!doc.needs_flush());
            assert_eq!(doc.inflight_seq(), Some(1));
        }
    }

    mod acking {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn ack_advances_the_version_and_answers_the_caller() {
            let mut doc = subscribed_text_doc("hello", 1);
            let mut reply = submit(&mut doc, text_insert(1, "X"));
            doc.take_next_for_flight(1).expect("head should flush");

            doc.handle_ack(2);

            assert_eq!(doc.state().version, 2);
            assert_eq!(reply.try_recv().expect("acked").expect("ok"), 2);
            assert!(doc.inflight_seq().is_none());
        }

        #[test]
        fn next_pending_op_flushes_after_the_ack() {
            let mut doc = subscribed_text_doc("hello", 1);
            submit(&mut doc, text_insert(0, "a"));
            submit(&mut doc, text_insert(0, "b"));
            doc.take_next_for_flight(1).expect("head should flush");
            doc.handle_ack(2);

            assert!(doc.needs_flush());
            let second = doc.take_next_for_flight(2).expect("second should flush");
            assert_eq!(second.v, Some(2));
        }
    }

    mod remote_ops {
        use super::*;
        use pretty_assertions::assert_eq;
        use tracing_test::traced_test;

        #[traced_test]
        #[test]
        fn remote_op_applies_and_advances_the_version() {
            let mut doc = subscribed_text_doc("hello", 1);
            doc.handle_remote(text_insert(1, "X").at(1).by("other", 1))
                .expect("remote applies");

            assert_eq!(text(&doc), "hXello");
            assert_eq!(doc.state().version, 2);
        }

        #[traced_test]
        #[test]
        fn duplicates_and_future_ops_are_dropped() {
            let mut doc = subscribed_text_doc("hello", 3);

            doc.handle_remote(text_insert(1, "X").at(1).by("other", 1))
                .expect("duplicate is ignored");
            doc.handle_remote(text_insert(1, "X").at(7).by("other", 2))
                .expect("future op is ignored");

            assert_eq!(text(&doc), "hello");
            assert_eq!(doc.state().version, 3);
        }

        #[test]
        fn concurrent_insert_rebases_the_inflight_op() {
            // We optimistically hold "Bhello" with B@0 in flight; the other
            // client's A@0 won the race to the server.
            let mut doc = subscribed_text_doc("hello", 1);
            submit(&mut doc, text_insert(0, "B"));
            doc.take_next_for_flight(1).expect("head should flush");

            doc.handle_remote(text_insert(0, "A").at(1).by("other", 1))
                .expect("remote applies");

            // Our insert keeps position 0; the remote op shifted behind it.
            assert_eq!(text(&doc), "BAhello");
            assert_eq!(doc.state().version, 2);
            doc.handle_ack(3);
            assert_eq!(doc.state().version, 3);
        }

        #[test]
        fn pending_queue_is_rebased_in_order() {
            let mut doc = subscribed_text_doc("hello", 1);
            submit(&mut doc, text_insert(0, "a"));
            submit(&mut doc, text_insert(1, "b"));
            doc.take_next_for_flight(1).expect("head should flush");

            doc.handle_remote(text_insert(5, "!").at(1).by("other", 1))
                .expect("remote applies");

            assert_eq!(text(&doc), "abhello!");
        }

        #[test]
        fn local_delete_neutralizes_the_remote_op() {
            let mut doc = subscribed_text_doc("hello", 1);
            submit(&mut doc, Op::del());
            doc.take_next_for_flight(1).expect("head should flush");

            doc.handle_remote(text_insert(0, "X").at(1).by("other", 1))
                .expect("remote neutralized");

            // Still deleted locally; the version moved past the remote op.
            assert_eq!(doc.state().data, None);
            assert_eq!(doc.state().version, 2);
        }

        #[test]
        fn remote_delete_fails_the_pipeline() {
            let mut doc = subscribed_text_doc("hello", 1);
            submit(&mut doc, text_insert(0, "X"));
            doc.take_next_for_flight(1).expect("head should flush");

            let err = doc
                .handle_remote(Op::del().at(1).by("other", 1))
                .expect_err("pipeline cannot survive");
            assert_eq!(err.code(), "WasDeleted");
        }

        #[test]
        fn remote_create_with_pending_work_fails_the_pipeline() {
            let mut doc = doc();
            doc.mark_subscribe_requested(None);
            doc.handle_subscribe_reply(Some(Snapshot::empty("doc1")), None);
            submit(&mut doc, text_create("mine"));
            doc.take_next_for_flight(1).expect("head should flush");

            let err = doc
                .handle_remote(text_create("theirs").at(0).by("other", 1))
                .expect_err("concurrent create");
            assert_eq!(err.code(), "AlreadyCreated");
        }
    }

    mod rollback {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn hard_rollback_drops_the_pipeline_and_fails_callbacks() {
            let mut doc = subscribed_text_doc("hello", 1);
            let mut first = submit(&mut doc, text_insert(0, "a"));
            let mut second = submit(&mut doc, text_insert(0, "b"));
            doc.take_next_for_flight(1).expect("head should flush");

            doc.hard_rollback(&OtError::WasDeleted.envelope());

            for reply in [&mut first, &mut second] {
                let result = reply.try_recv().expect("callback fired");
                assert_eq!(result.expect_err("failed").code(), "WasDeleted");
            }
            assert_eq!(doc.state().data, None);
            assert_eq!(doc.state().kind, None);
            assert!(!doc.state().subscribed);
            assert!(doc.wants_subscribe());
            assert!(!doc.needs_flush());
        }
    }

    mod connection_state {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn disconnect_returns_the_inflight_op_to_the_queue() {
            let mut doc = subscribed_text_doc("hello", 1);
            submit(&mut doc, text_insert(0, "a"));
            doc.take_next_for_flight(1).expect("head should flush");
            assert!(!doc.needs_flush());

            doc.connection_closed();

            assert!(doc.needs_flush());
            assert!(doc.wants_subscribe());
            let resent = doc.take_next_for_flight(2).expect("op is resent");
            assert_eq!(resent.seq, Some(2));
        }

        #[test]
        fn subscribe_reply_with_queued_work_keeps_local_state() {
            let mut doc = doc();
            submit(&mut doc, text_create("mine"));
            doc.mark_subscribe_requested(None);

            doc.handle_subscribe_reply(Some(Snapshot::empty("doc1")), None);

            assert_eq!(text(&doc), "mine");
            assert_eq!(doc.state().version, 0);
            assert!(doc.state().subscribed);
        }
    }

    mod events {
        use super::*;

        #[test]
        fn local_and_remote_ops_emit_events() {
            let mut doc = subscribed_text_doc("hello", 1);
            let mut events = doc.events();

            submit(&mut doc, text_insert(0, "X"));
            doc.handle_remote(text_insert(0, "Y").at(1).by("other", 1))
                .expect("remote applies");

            let first = events.try_recv().expect("local event");
            assert!(matches!(
                first,
                DocEvent::Op {
                    source: OpSource::Local,
                    ..
                }
            ));
            let second = events.try_recv().expect("remote event");
            assert!(matches!(
                second,
                DocEvent::Op {
                    source: OpSource::Remote,
                    ..
                }
            ));
        }
    }
}
