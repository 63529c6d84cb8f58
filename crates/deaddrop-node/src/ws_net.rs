// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! WebSocket plumbing: pumps between real sockets and the event duplex
//! the protocol handler runs on.  Inbound connections arrive through
//! axum's upgrade; outbound connections dial the peer's `/wsapi/v2/ws/`
//! endpoint and reconnect with a fixed delay for as long as the process
//! lives.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use deaddrop_core::{EventDuplex, MessageStore, WsHandler};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as TungsteniteMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const FRAME_BUFFER: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(15);

/// Serve one peer that connected to us.  The remote identity is learned
/// from its first status event, so the handler starts without a mirror
/// cache.
pub async fn serve_inbound(store: Arc<MessageStore>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<String>(FRAME_BUFFER);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(AxumMessage::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                AxumMessage::Text(text) => {
                    if in_tx.send(text).await.is_err() {
                        break;
                    }
                }
                AxumMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    let handle = WsHandler::spawn(
        store,
        EventDuplex::from_parts(out_tx, in_rx),
        None,
        None,
    );
    handle.closed().await;
}

/// Keep one outbound gossip link alive: dial, run the handler until it
/// closes (watchdog, remote hangup, shutdown), wait, redial.
pub fn spawn_peer_dialer(store: Arc<MessageStore>, host: String, port: u16) {
    tokio::spawn(async move {
        let url = format!("ws://{host}:{port}/wsapi/v2/ws/");
        loop {
            match connect_async(url.as_str()).await {
                Ok((socket, _)) => {
                    info!(peer = %format!("{host}:{port}"), "peer ws connected");
                    match store.local_cache().add_peer(&host, port) {
                        Ok(remote) => {
                            run_outbound(store.clone(), socket, remote).await;
                            warn!(peer = %format!("{host}:{port}"), "peer ws closed");
                        }
                        Err(e) => warn!(peer = %host, %e, "peer registration failed"),
                    }
                }
                Err(e) => debug!(peer = %format!("{host}:{port}"), %e, "peer dial failed"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });
}

async fn run_outbound(
    store: Arc<MessageStore>,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    remote: Arc<deaddrop_core::PeerHeaderCache>,
) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<String>(FRAME_BUFFER);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(TungsteniteMessage::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                TungsteniteMessage::Text(text) => {
                    if in_tx.send(text).await.is_err() {
                        break;
                    }
                }
                TungsteniteMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    let handle = WsHandler::spawn(
        store,
        EventDuplex::from_parts(out_tx, in_rx),
        Some(remote),
        None,
    );
    handle.closed().await;
}
