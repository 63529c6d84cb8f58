// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::PathBuf;

/// Protocol version advertised in status exchanges.
pub const NODE_VERSION: &str = "0.2.0";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Hostname advertised to peers; empty when the node has no public
    /// address yet.
    pub ext_host: String,
    /// Advertised message-service port.
    pub msg_port: u16,
    /// Advertised token-service port.
    pub tok_port: u16,
    /// Hex of the node's ephemeral compressed public key.
    pub pubkey_hex: String,
    /// Staging directory for uploads and peer downloads.
    pub receive_dir: PathBuf,
    /// Full refresh-loop period; sync and discovery each run once per
    /// period, half a period apart.
    pub refresh_interval_secs: u64,
    /// Concurrent blob downloads during sync.
    pub fetch_concurrency: usize,
    pub max_file_size: u64,
    pub capacity: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ext_host: String::new(),
            msg_port: 8080,
            tok_port: 7764,
            pubkey_hex: String::new(),
            receive_dir: PathBuf::from("./receive"),
            refresh_interval_secs: 60,
            fetch_concurrency: 8,
            max_file_size: 8 * 1024 * 1024,
            capacity: 256 * 1024 * 1024 * 1024,
        }
    }
}
