// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Per-peer gossip protocol over an event-named duplex channel.
//!
//! The handler owns one peer connection.  Three tickles keep the link
//! warm (time, status, peer exchange) and a watchdog tears it down when
//! the peer goes quiet.  Headers inserted into the local cache are
//! pushed to every connected peer through the cache's broadcast bus;
//! headers received from a peer flow the other way, gated by the shard
//! sector.
//!
//! The WebSocket itself lives in the node binary — this module only
//! sees an [`EventDuplex`], a pair of string-frame channels, which is
//! also what the tests drive directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::dto::{PeerItemResponse, StatusResponse};
use crate::error::{Result, StoreError};
use crate::header::{unix_now, MessageHeader};
use crate::peer_cache::PeerHeaderCache;
use crate::store::MessageStore;

pub const TIME_TICKLE: Duration = Duration::from_secs(30);
pub const STATUS_TICKLE: Duration = Duration::from_secs(300);
pub const PEERS_TICKLE: Duration = Duration::from_secs(300);
pub const WATCHDOG: Duration = Duration::from_secs(150);

const EV_REQUEST_TIME: &str = "request-time";
const EV_RESPONSE_TIME: &str = "response-time";
const EV_REQUEST_STATUS: &str = "request-status";
const EV_RESPONSE_STATUS: &str = "response-status";
const EV_REQUEST_PEERS: &str = "request-peers";
const EV_RESPONSE_PEER: &str = "response-peer";
const EV_RESPONSE_HEADER: &str = "response-header";

/// One protocol event.  On the wire a frame is
/// `<event-name>:<payload>`, the payload keeping whatever colons it
/// contains; request events carry no payload.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    RequestTime,
    ResponseTime(u32),
    RequestStatus,
    ResponseStatus(StatusResponse),
    RequestPeers,
    ResponsePeer(PeerItemResponse),
    ResponseHeader(MessageHeader),
}

impl WsEvent {
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            WsEvent::RequestTime => EV_REQUEST_TIME.to_string(),
            WsEvent::ResponseTime(t) => format!("{EV_RESPONSE_TIME}:{t}"),
            WsEvent::RequestStatus => EV_REQUEST_STATUS.to_string(),
            WsEvent::ResponseStatus(status) => format!(
                "{EV_RESPONSE_STATUS}:{}",
                serde_json::to_string(status)
                    .map_err(|e| StoreError::Transport(e.to_string()))?
            ),
            WsEvent::RequestPeers => EV_REQUEST_PEERS.to_string(),
            WsEvent::ResponsePeer(item) => format!(
                "{EV_RESPONSE_PEER}:{}",
                serde_json::to_string(item)
                    .map_err(|e| StoreError::Transport(e.to_string()))?
            ),
            WsEvent::ResponseHeader(header) => {
                format!("{EV_RESPONSE_HEADER}:{}", header.serialize())
            }
        })
    }

    pub fn decode(frame: &str) -> Result<Self> {
        let (name, payload) = frame.split_once(':').unwrap_or((frame, ""));
        match name {
            EV_REQUEST_TIME => Ok(WsEvent::RequestTime),
            EV_RESPONSE_TIME => payload
                .parse()
                .map(WsEvent::ResponseTime)
                .map_err(|_| StoreError::MalformedHeader("time payload".into())),
            EV_REQUEST_STATUS => Ok(WsEvent::RequestStatus),
            EV_RESPONSE_STATUS => serde_json::from_str(payload)
                .map(WsEvent::ResponseStatus)
                .map_err(|_| StoreError::MalformedHeader("status payload".into())),
            EV_REQUEST_PEERS => Ok(WsEvent::RequestPeers),
            EV_RESPONSE_PEER => serde_json::from_str(payload)
                .map(WsEvent::ResponsePeer)
                .map_err(|_| StoreError::MalformedHeader("peer payload".into())),
            EV_RESPONSE_HEADER => MessageHeader::deserialize(payload).map(WsEvent::ResponseHeader),
            other => Err(StoreError::MalformedHeader(format!(
                "unknown event {other:?}"
            ))),
        }
    }
}

/// The transport seam: an event-named duplex channel with emit/recv
/// semantics.  The node binary pumps one of these per WebSocket; tests
/// wire two back to back.
pub struct EventDuplex {
    out_tx: mpsc::Sender<String>,
    in_rx: mpsc::Receiver<String>,
}

impl EventDuplex {
    pub fn from_parts(out_tx: mpsc::Sender<String>, in_rx: mpsc::Receiver<String>) -> Self {
        Self { out_tx, in_rx }
    }

    pub async fn emit(&self, event: &WsEvent) -> Result<()> {
        self.out_tx
            .send(event.encode()?)
            .await
            .map_err(|_| StoreError::Transport("peer channel closed".into()))
    }

    /// Next inbound frame; `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.in_rx.recv().await
    }
}

/// Two transports wired back to back, as a WebSocket would join them.
pub fn channel_pair(capacity: usize) -> (EventDuplex, EventDuplex) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        EventDuplex::from_parts(a_tx, b_rx),
        EventDuplex::from_parts(b_tx, a_rx),
    )
}

/// Live handlers, keyed by a monotonic id so teardown needs no pointer
/// identity.  Owned by the message store rather than living as a
/// process global.
pub struct WsRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<u64, watch::Sender<bool>>>,
}

impl Default for WsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WsRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self) -> (u64, watch::Receiver<bool>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(false);
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        (id, rx)
    }

    fn remove(&self, id: u64) {
        if self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_none()
        {
            // teardown raced an explicit disconnect; nothing to do
            debug!(id, "handler already removed from registry");
        }
    }

    /// Ask one handler to shut down.  Idempotent; unknown ids are
    /// ignored.
    pub fn disconnect(&self, id: u64) {
        if let Some(tx) = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
        {
            let _ = tx.send(true);
        }
    }

    pub fn disconnect_all(&self) {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        for tx in handlers.values() {
            let _ = tx.send(true);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }
}

pub type DisconnectHook = Box<dyn FnOnce() + Send + 'static>;

pub struct WsHandlerHandle {
    pub id: u64,
    task: JoinHandle<()>,
}

impl WsHandlerHandle {
    /// Wait for the handler's event loop to finish.
    pub async fn closed(self) {
        let _ = self.task.await;
    }
}

pub struct WsHandler;

impl WsHandler {
    /// Register and start one handler.  `remote` is the peer's mirror
    /// cache when the connection is outbound; inbound handlers start
    /// without one and adopt it from the peer's first status event.
    /// `on_disconnect` runs exactly once, after the handler has left
    /// the registry.
    pub fn spawn(
        store: Arc<MessageStore>,
        transport: EventDuplex,
        remote: Option<Arc<PeerHeaderCache>>,
        on_disconnect: Option<DisconnectHook>,
    ) -> WsHandlerHandle {
        let (id, cancel) = store.registry().register();
        debug!(id, outbound = remote.is_some(), "ws handler connected");
        let task = tokio::spawn(async move {
            run_event_loop(&store, transport, remote, id, cancel).await;
            store.registry().remove(id);
            if let Some(hook) = on_disconnect {
                hook();
            }
            debug!(id, "ws handler closed");
        });
        WsHandlerHandle { id, task }
    }
}

async fn run_event_loop(
    store: &Arc<MessageStore>,
    mut transport: EventDuplex,
    mut remote: Option<Arc<PeerHeaderCache>>,
    id: u64,
    mut cancel: watch::Receiver<bool>,
) {
    let mut bus = store.local_cache().subscribe();

    let start = Instant::now();
    let mut time_deadline = start + TIME_TICKLE;
    let mut status_deadline = start + STATUS_TICKLE;
    let mut peers_deadline = start + PEERS_TICKLE;
    let mut watchdog_deadline = start + WATCHDOG;

    // one-shot: the peer immediately learns our peer list
    if tx_peers(store, &transport).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            inbound = transport.recv() => {
                let Some(frame) = inbound else {
                    debug!(id, "transport closed");
                    break;
                };
                match WsEvent::decode(&frame) {
                    Err(e) => {
                        // dropped without feeding the watchdog
                        warn!(id, %e, "dropping undecodable event");
                    }
                    Ok(event) => {
                        watchdog_deadline = Instant::now() + WATCHDOG;
                        let outcome = handle_event(
                            store,
                            &transport,
                            &mut remote,
                            event,
                            &mut time_deadline,
                            &mut status_deadline,
                        )
                        .await;
                        if outcome.is_err() {
                            break;
                        }
                    }
                }
            }
            pushed = bus.recv() => {
                match pushed {
                    Ok(header) => {
                        let peer_has_it = match &remote {
                            Some(r) => r.contains(header.i_key()).unwrap_or(false),
                            None => false,
                        };
                        if !peer_has_it
                            && transport
                                .emit(&WsEvent::ResponseHeader(header))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // peer sweep will backfill what the bus dropped
                        warn!(id, missed, "header bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = sleep_until(time_deadline) => {
                if transport.emit(&WsEvent::RequestTime).await.is_err() {
                    break;
                }
                time_deadline = Instant::now() + TIME_TICKLE;
            }
            _ = sleep_until(status_deadline) => {
                if transport.emit(&WsEvent::RequestStatus).await.is_err() {
                    break;
                }
                status_deadline = Instant::now() + STATUS_TICKLE;
            }
            _ = sleep_until(peers_deadline) => {
                if transport.emit(&WsEvent::RequestPeers).await.is_err() {
                    break;
                }
                peers_deadline = Instant::now() + PEERS_TICKLE;
            }
            _ = sleep_until(watchdog_deadline) => {
                info!(id, "watchdog expired, disconnecting peer");
                break;
            }
            _ = cancel.changed() => {
                debug!(id, "handler cancelled");
                break;
            }
        }
    }
}

async fn handle_event(
    store: &Arc<MessageStore>,
    transport: &EventDuplex,
    remote: &mut Option<Arc<PeerHeaderCache>>,
    event: WsEvent,
    time_deadline: &mut Instant,
    status_deadline: &mut Instant,
) -> Result<()> {
    match event {
        WsEvent::RequestTime => {
            transport.emit(&WsEvent::ResponseTime(unix_now())).await?;
            *time_deadline = Instant::now() + TIME_TICKLE;
        }
        WsEvent::ResponseTime(reported) => {
            if let Some(r) = remote {
                r.observe_time(reported);
            }
        }
        WsEvent::RequestStatus => {
            transport
                .emit(&WsEvent::ResponseStatus(store.status()))
                .await?;
            *status_deadline = Instant::now() + STATUS_TICKLE;
        }
        WsEvent::ResponseStatus(status) => {
            rx_status(store, remote, status);
        }
        WsEvent::RequestPeers => {
            tx_peers(store, transport).await?;
        }
        WsEvent::ResponsePeer(item) => {
            let config = store.config();
            if item.host == config.ext_host && item.port == config.msg_port {
                return Ok(());
            }
            if let Err(e) = store.local_cache().add_peer(&item.host, item.port) {
                warn!(%e, "adopting gossiped peer failed");
            }
        }
        WsEvent::ResponseHeader(header) => {
            rx_header(store, remote, header);
        }
    }
    Ok(())
}

async fn tx_peers(store: &Arc<MessageStore>, transport: &EventDuplex) -> Result<()> {
    for item in store.local_cache().list_peers() {
        transport.emit(&WsEvent::ResponsePeer(item)).await?;
    }
    Ok(())
}

/// An inbound status identifies the remote; handlers that started
/// without a mirror cache adopt one from the peer registry here.
fn rx_status(
    store: &Arc<MessageStore>,
    remote: &mut Option<Arc<PeerHeaderCache>>,
    status: StatusResponse,
) {
    if remote.is_none() {
        let host = status.network.host.clone();
        let port = status.network.msg_port;
        if host.is_empty() {
            debug!("peer status carries no address, cannot adopt");
            return;
        }
        match store.local_cache().add_peer(&host, port) {
            Ok(peer) => {
                info!(peer = %peer.key(), "adopted inbound peer");
                *remote = Some(peer);
            }
            Err(e) => {
                warn!(%e, "peer adoption failed");
                return;
            }
        }
    }
    if let Some(r) = remote {
        r.set_status(status);
    }
}

/// Inbound header gossip: record it as known-to-peer; if it is news and
/// our sector wants it, advertise it locally (which fans it out to the
/// other handlers) and pull the blob in the background.
fn rx_header(
    store: &Arc<MessageStore>,
    remote: &mut Option<Arc<PeerHeaderCache>>,
    header: MessageHeader,
) {
    let Some(peer) = remote else {
        debug!("header from unidentified peer dropped");
        return;
    };
    let new_to_peer = match peer.insert(&header) {
        Ok(new) => new,
        Err(StoreError::Expired) => return,
        Err(e) => {
            warn!(peer = %peer.key(), %e, "peer mirror insert failed");
            return;
        }
    };
    if !new_to_peer || !store.in_sector(header.i_key()) {
        return;
    }
    match store.local_cache().insert(&header) {
        Ok(_) | Err(StoreError::Expired) => {}
        Err(e) => {
            warn!(%e, "local insert of gossiped header failed");
            return;
        }
    }
    let store = Arc::clone(store);
    let i = *header.i_key();
    tokio::spawn(async move {
        if let Err(e) = store.find_or_fetch_by_i(&i).await {
            debug!(i = %hex::encode(i), %e, "gossip-triggered fetch failed");
        }
    });
}
