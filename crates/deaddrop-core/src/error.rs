// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use thiserror::Error;

/// Error kinds surfaced by the caches, the message store and the peer
/// client.  `Duplicate` and `Expired` are non-fatal insert outcomes;
/// `Transport` failures are retried at the next sync tick; `Storage`
/// failures are surfaced unchanged so the operator sees the disk fault.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("duplicate header")]
    Duplicate,

    #[error("header already expired")]
    Expired,

    #[error("header outside shard sector")]
    OutOfSector,

    #[error("not found")]
    NotFound,

    #[error("transport: {0}")]
    Transport(String),

    #[error("storage: {0}")]
    Storage(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
