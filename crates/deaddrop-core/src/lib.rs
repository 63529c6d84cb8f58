pub mod cache;
pub mod client;
pub mod config;
pub mod dto;
pub mod error;
pub mod header;
pub mod kv;
pub mod local_cache;
pub mod message;
pub mod peer_cache;
pub mod sector;
pub mod store;
pub mod ws;

pub use cache::{CachedHeader, HeaderIndex};
pub use client::{HttpPeerApi, PeerApi};
pub use config::{NodeConfig, NODE_VERSION};
pub use dto::{
    HeaderListResponse, MessageHeaderJson, MessageListResponse, MessageUploadResponse,
    PeerItemResponse, StatusNetworkResponse, StatusResponse, StatusStorageResponse, TimeResponse,
};
pub use error::StoreError;
pub use header::{unix_now, HeaderVersion, MessageHeader};
pub use kv::{MemoryKv, OrderedKv, SledKv};
pub use local_cache::LocalHeaderCache;
pub use message::{blob_path, MessageFile};
pub use peer_cache::PeerHeaderCache;
pub use sector::{i_prefix, ShardSector, SECTOR_BINS};
pub use store::MessageStore;
pub use ws::{
    channel_pair, EventDuplex, WsEvent, WsHandler, WsHandlerHandle, WsRegistry, PEERS_TICKLE,
    STATUS_TICKLE, TIME_TICKLE, WATCHDOG,
};

#[cfg(test)]
mod conformance;
