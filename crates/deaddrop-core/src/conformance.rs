// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Multi-node conformance scenarios: two in-process nodes wired through
//! an in-memory peer API and a back-to-back event channel, exercising
//! the full upload → gossip → fetch path without sockets.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::HeaderIndex;
use crate::client::PeerApi;
use crate::config::NodeConfig;
use crate::dto::{MessageHeaderJson, PeerItemResponse, StatusResponse};
use crate::error::{Result, StoreError};
use crate::header::testutil::header_with_i;
use crate::header::MessageHeader;
use crate::kv::MemoryKv;
use crate::local_cache::LocalHeaderCache;
use crate::message::MessageFile;
use crate::sector::{i_prefix, ShardSector};
use crate::store::MessageStore;
use crate::ws::{channel_pair, WsHandler};

/// Routes peer API calls to in-process stores by hostname.
#[derive(Default)]
struct LoopbackApi {
    nodes: Mutex<HashMap<String, Arc<MessageStore>>>,
}

impl LoopbackApi {
    fn register(&self, host: &str, store: Arc<MessageStore>) {
        self.nodes
            .lock()
            .expect("lock")
            .insert(host.to_string(), store);
    }

    fn node(&self, host: &str) -> Result<Arc<MessageStore>> {
        self.nodes
            .lock()
            .expect("lock")
            .get(host)
            .cloned()
            .ok_or_else(|| StoreError::Transport(format!("no route to {host}")))
    }
}

#[async_trait]
impl PeerApi for LoopbackApi {
    async fn get_time(&self, _host: &str, _port: u16) -> Result<u32> {
        Ok(crate::header::unix_now())
    }

    async fn get_status(&self, host: &str, _port: u16) -> Result<StatusResponse> {
        Ok(self.node(host)?.status())
    }

    async fn get_headers_since(
        &self,
        host: &str,
        _port: u16,
        since: u32,
    ) -> Result<Vec<MessageHeader>> {
        Ok(self
            .node(host)?
            .local_cache()
            .find_since(since)?
            .into_iter()
            .map(|c| c.header)
            .collect())
    }

    async fn get_header(
        &self,
        host: &str,
        _port: u16,
        i: &[u8; 33],
    ) -> Result<Option<MessageHeaderJson>> {
        Ok(self
            .node(host)?
            .local_cache()
            .find_by_i(i)?
            .map(|c| c.header.to_json()))
    }

    async fn get_message(&self, host: &str, _port: u16, i: &[u8; 33]) -> Result<Vec<u8>> {
        let found = self.node(host)?.find_by_i(i)?.ok_or(StoreError::NotFound)?;
        Ok(std::fs::read(found.filepath)?)
    }

    async fn get_peers(&self, host: &str, _port: u16) -> Result<Vec<PeerItemResponse>> {
        Ok(self.node(host)?.local_cache().list_peers())
    }

    async fn post_peer(&self, host: &str, _port: u16, item: &PeerItemResponse) -> Result<()> {
        self.node(host)?
            .local_cache()
            .add_peer(&item.host, item.port)?;
        Ok(())
    }
}

struct TestNode {
    host: &'static str,
    store: Arc<MessageStore>,
}

fn build_node(
    root: &std::path::Path,
    host: &'static str,
    api: Arc<LoopbackApi>,
) -> TestNode {
    let base = root.join(host);
    let lhc = LocalHeaderCache::open(base.join("headers"), api.clone()).expect("lhc");
    let config = NodeConfig {
        ext_host: host.into(),
        receive_dir: base.join("receive"),
        ..NodeConfig::default()
    };
    let store = MessageStore::open(base.join("messages"), lhc, 0x200, api.clone(), config)
        .expect("store");
    api.register(host, store.clone());
    TestNode { host, store }
}

fn upload(node: &TestNode, header: &MessageHeader) -> PathBuf {
    let staged = node.store.staging_path();
    let mut blob = header.export_bytes();
    blob.extend_from_slice(&[0x42u8; 300]);
    std::fs::write(&staged, blob).expect("stage blob");
    let dest = node.store.blob_dest(header.i_key());
    MessageFile::ingest(&staged)
        .expect("ingest")
        .promote(&dest)
        .expect("promote");
    node.store.insert_file(&dest).expect("insert upload");
    dest
}

async fn eventually(mut probe: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    probe()
}

fn i_in_bin(bin: u16, fill: u8) -> [u8; 33] {
    let mut i = [fill; 33];
    i[0] = (bin >> 2) as u8;
    i[1] = ((bin & 0x3) as u8) << 6 | (fill & 0x3F);
    assert_eq!(i_prefix(&i), bin);
    i
}

#[test]
fn insert_list_expire_lifecycle() {
    let index = HeaderIndex::open(Arc::new(MemoryKv::new())).expect("open");
    let header = header_with_i(1000, 2000, i_in_bin(0x210, 0x11));

    assert!(index.insert(&header, 1500).expect("insert"));
    let listed = index.find_since(0).expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].header, header);

    let evicted = index.expire(2001).expect("sweep");
    assert_eq!(evicted.len(), 1);
    assert!(index.find_by_i(header.i_key()).expect("find").is_none());
    assert_eq!(index.count(), 0);
}

#[tokio::test]
async fn gossip_carries_upload_to_admitting_peer() {
    let root = tempfile::tempdir().expect("tempdir");
    let api = Arc::new(LoopbackApi::default());
    let a = build_node(root.path(), "a.example", api.clone());
    let b = build_node(root.path(), "b.example", api.clone());

    // b admits only bins 0x200..0x202
    b.store.set_target(ShardSector {
        start: 0x200,
        ring: 1,
    });

    let a_view_of_b = a
        .store
        .local_cache()
        .add_peer(b.host, 8080)
        .expect("a knows b");
    let b_view_of_a = b
        .store
        .local_cache()
        .add_peer(a.host, 8080)
        .expect("b knows a");

    let (a_side, b_side) = channel_pair(256);
    let handler_a = WsHandler::spawn(a.store.clone(), a_side, Some(a_view_of_b), None);
    let handler_b = WsHandler::spawn(b.store.clone(), b_side, Some(b_view_of_a.clone()), None);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // upload into a's sector overlap with b
    let admitted = header_with_i(1000, u32::MAX, i_in_bin(0x201, 0x33));
    upload(&a, &admitted);

    assert!(
        eventually(|| b_view_of_a.contains(admitted.i_key()).unwrap_or(false)).await,
        "b's mirror of a never saw the header"
    );
    assert!(
        eventually(|| {
            b.store
                .local_cache()
                .find_by_i(admitted.i_key())
                .ok()
                .flatten()
                .is_some()
        })
        .await,
        "b's local cache missed an admitted header"
    );
    assert!(
        eventually(|| b.store.find_by_i(admitted.i_key()).ok().flatten().is_some()).await,
        "b never fetched the admitted blob"
    );

    // a second upload outside b's sector: mirrored, never adopted
    let rejected = header_with_i(1000, u32::MAX, i_in_bin(0x300, 0x44));
    upload(&a, &rejected);
    assert!(
        eventually(|| b_view_of_a.contains(rejected.i_key()).unwrap_or(false)).await,
        "b's mirror of a never saw the out-of-sector header"
    );
    assert!(
        b.store
            .local_cache()
            .find_by_i(rejected.i_key())
            .expect("find")
            .is_none(),
        "out-of-sector header must stay out of b's local cache"
    );
    assert!(b.store.find_by_i(rejected.i_key()).expect("find").is_none());

    b.store.registry().disconnect(handler_b.id);
    a.store.registry().disconnect(handler_a.id);
    handler_a.closed().await;
    handler_b.closed().await;
}

#[tokio::test]
async fn sync_pulls_missed_messages_without_ws() {
    let root = tempfile::tempdir().expect("tempdir");
    let api = Arc::new(LoopbackApi::default());
    let a = build_node(root.path(), "a.example", api.clone());
    let b = build_node(root.path(), "b.example", api.clone());

    let header = header_with_i(1000, u32::MAX, i_in_bin(0x250, 0x55));
    upload(&a, &header);

    b.store
        .local_cache()
        .add_peer(a.host, 8080)
        .expect("b knows a");
    b.store.sync().await;

    assert!(
        b.store.find_by_i(header.i_key()).expect("find").is_some(),
        "sync must backfill the blob over HTTP"
    );
    assert_eq!(b.store.count(), 1);
}

#[tokio::test]
async fn discovery_introduces_nodes_transitively() {
    let root = tempfile::tempdir().expect("tempdir");
    let api = Arc::new(LoopbackApi::default());
    let a = build_node(root.path(), "a.example", api.clone());
    let b = build_node(root.path(), "b.example", api.clone());
    let c = build_node(root.path(), "c.example", api.clone());

    // a knows b; b knows c; nobody knows a
    a.store
        .local_cache()
        .add_peer(b.host, 8080)
        .expect("a->b");
    b.store
        .local_cache()
        .add_peer(c.host, 8080)
        .expect("b->c");

    a.store.local_cache().discover_peers("a.example", 8080).await;

    // a announced itself to b and learned b's peer c
    assert!(b.store.local_cache().find_peer("a.example", 8080).is_some());
    assert!(a.store.local_cache().find_peer("c.example", 8080).is_some());
    let _ = c;
}
