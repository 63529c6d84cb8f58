// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! JSON wire shapes for the REST surface and the WS status exchange.
//! Field names are fixed by the network protocol — do not rename.

use serde::{Deserialize, Serialize};

use crate::sector::ShardSector;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeResponse {
    pub time: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderListResponse {
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageListResponse {
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageUploadResponse {
    pub header: String,
    pub servertime: u32,
}

/// One peer as gossiped over `response-peer` events and the peers
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerItemResponse {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusNetworkResponse {
    pub host: String,
    #[serde(rename = "MSGPort")]
    pub msg_port: u16,
    #[serde(rename = "TOKPort")]
    pub tok_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusStorageResponse {
    pub headers: u64,
    pub messages: u64,
    pub maxfilesize: u64,
    pub capacity: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub network: StatusNetworkResponse,
    pub pubkey: String,
    pub storage: StatusStorageResponse,
    pub sector: ShardSector,
    pub version: String,
}

/// JSON projection of one header, served by the header-info endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageHeaderJson {
    pub version: String,
    pub time: u32,
    pub expire: u32,
    pub time_str: String,
    pub expire_str: String,
    #[serde(rename = "I")]
    pub i: String,
    #[serde(rename = "J")]
    pub j: String,
    #[serde(rename = "K")]
    pub k: String,
    #[serde(rename = "Size")]
    pub size: u64,
    pub sig_r: String,
    pub sig_s: String,
    pub nonce: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_json_uses_protocol_field_names() {
        let status = StatusResponse {
            network: StatusNetworkResponse {
                host: "node.example".into(),
                msg_port: 8080,
                tok_port: 7764,
            },
            pubkey: "02ab".into(),
            storage: StatusStorageResponse {
                headers: 10,
                messages: 4,
                maxfilesize: 8 * 1024 * 1024,
                capacity: 256 * 1024 * 1024 * 1024,
                used: 0,
            },
            sector: ShardSector { start: 0x200, ring: 1 },
            version: "0.2.0".into(),
        };
        let text = serde_json::to_string(&status).expect("encode");
        assert!(text.contains("\"MSGPort\":8080"));
        assert!(text.contains("\"TOKPort\":7764"));
        assert!(text.contains("\"start\":512"));
        let back: StatusResponse = serde_json::from_str(&text).expect("decode");
        assert_eq!(back, status);
    }

    #[test]
    fn header_json_uses_upper_case_point_names() {
        let js = MessageHeaderJson {
            version: "0200".into(),
            time: 1,
            expire: 2,
            time_str: "1970-01-01 00:00:01".into(),
            expire_str: "1970-01-01 00:00:02".into(),
            i: "02aa".into(),
            j: "03bb".into(),
            k: "02cc".into(),
            size: 512,
            sig_r: "dd".into(),
            sig_s: "ee".into(),
            nonce: 7,
        };
        let text = serde_json::to_string(&js).expect("encode");
        assert!(text.contains("\"I\":\"02aa\""));
        assert!(text.contains("\"Size\":512"));
        assert!(text.contains("\"sig_r\":\"dd\""));
    }
}
