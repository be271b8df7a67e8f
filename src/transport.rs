// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The abstract bidirectional message channel between a client and the
//! server: in-order, at-most-once per direction while connected. Dropping
//! either half is a disconnect; reconnecting means making a new pair.

use crate::protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 256;

/// The half a [`crate::connection::Connection`] drives.
pub struct ClientTransport {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<ServerMessage>,
}

/// The half the server's backend drives.
pub struct ServerTransport {
    pub outbound: mpsc::Sender<ServerMessage>,
    pub inbound: mpsc::Receiver<ClientMessage>,
}

/// A connected pair of transport halves.
#[must_use]
pub fn pair() -> (ClientTransport, ServerTransport) {
    let (client_tx, client_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (server_tx, server_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        ClientTransport {
            outbound: client_tx,
            inbound: server_rx,
        },
        ServerTransport {
            outbound: server_tx,
            inbound: client_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (client, mut server) = pair();

        for d in ["a", "b", "c"] {
            client
                .outbound
                .send(ClientMessage::Fetch {
                    c: "notes".into(),
                    d: d.into(),
                })
                .await
                .expect("send failed");
        }

        for expected in ["a", "b", "c"] {
            let message = server.inbound.recv().await.expect("receive failed");
            assert_eq!(message.target(), ("notes", expected));
        }
    }

    #[tokio::test]
    async fn dropping_a_half_closes_the_channel() {
        let (client, mut server) = pair();
        drop(client);
        assert!(server.inbound.recv().await.is_none());
    }
}
