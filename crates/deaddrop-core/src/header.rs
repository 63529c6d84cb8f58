// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Message header codec.
//!
//! Two wire formats coexist on the network:
//!
//! - **v1** — colon-separated ASCII,
//!   `M0100:TTTTTTTT:EEEEEEEE:<I hex>:<J hex>:<K hex>:<r hex>:<s hex>`,
//!   354 characters total.
//! - **v2** — a 192-byte binary record (magic `M\x02\x00\x00`) carried
//!   as 256 characters of standard base64.  A 123-byte / 164-character
//!   short form omits the signature and nonce.
//!
//! Parsed headers keep their version: a header read as v2 re-serializes
//! as v2, byte for byte.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::dto::MessageHeaderJson;
use crate::error::StoreError;

/// v1 ASCII serialization length:
/// `"M0100"` + 7 colons + 8+8 hex time fields + 3×66 hex points + 2×64 hex
/// signature halves.
pub const HEADER_LEN_V1: usize = 5 + 1 + 8 + 1 + 8 + 1 + 66 + 1 + 66 + 1 + 66 + 1 + 64 + 1 + 64;

/// v2 binary lengths (short form has no signature or nonce).
pub const SHORT_HEADER_LEN_V2: usize = 123;
pub const HEADER_LEN_V2: usize = 192;

/// v2 base64 lengths.
pub const SHORT_HEADER_LEN_B64_V2: usize = 164;
pub const HEADER_LEN_B64_V2: usize = 256;

const MAGIC_V2: &[u8; 4] = b"M\x02\x00\x00";

/// Message body length derives from `blocklen`: `(blocklen + 1) * 256`.
pub const BLOCK_GRANULE: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderVersion {
    V1,
    V2,
}

impl HeaderVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderVersion::V1 => "0100",
            HeaderVersion::V2 => "0200",
        }
    }
}

/// One message header.  `I` is the content identifier; `J`, `K` are
/// opaque compressed curve points and `r`, `s` an opaque signature —
/// none of them are interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    version: HeaderVersion,
    time: u32,
    expire: u32,
    i: [u8; 33],
    j: [u8; 33],
    k: [u8; 33],
    blocklen: u32,
    reserved: u64,
    r: [u8; 32],
    s: [u8; 32],
    nonce: u64,
}

impl MessageHeader {
    /// Parse the textual serialization, auto-detecting the version from
    /// the leading bytes (`M01` selects v1, anything else is tried as
    /// v2 base64).
    pub fn deserialize(s: &str) -> Result<Self, StoreError> {
        if s.as_bytes().get(..3) == Some(b"M01") {
            Self::parse_v1(s)
        } else {
            Self::parse_v2_b64(s)
        }
    }

    /// Parse raw bytes: v1 as its ASCII form, v2 as the binary record.
    pub fn import_bytes(b: &[u8]) -> Result<Self, StoreError> {
        if b.get(..3) == Some(b"M01") {
            let s = std::str::from_utf8(b)
                .map_err(|_| StoreError::MalformedHeader("v1 header is not ASCII".into()))?;
            Self::parse_v1(s)
        } else {
            Self::parse_v2_binary(b)
        }
    }

    fn parse_v1(s: &str) -> Result<Self, StoreError> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 8 || fields[0] != "M0100" {
            return Err(StoreError::MalformedHeader("v1 version string".into()));
        }
        if fields[1].len() != 8 || fields[2].len() != 8 {
            return Err(StoreError::MalformedHeader("v1 time field length".into()));
        }
        let time = u32::from_str_radix(fields[1], 16)
            .map_err(|_| StoreError::MalformedHeader("v1 time is not hex".into()))?;
        let expire = u32::from_str_radix(fields[2], 16)
            .map_err(|_| StoreError::MalformedHeader("v1 expire is not hex".into()))?;
        let i = hex_point(fields[3], "I")?;
        let j = hex_point(fields[4], "J")?;
        let k = hex_point(fields[5], "K")?;
        let r = hex_scalar(fields[6], "r")?;
        let s_ = hex_scalar(fields[7], "s")?;
        Ok(Self {
            version: HeaderVersion::V1,
            time,
            expire,
            i,
            j,
            k,
            blocklen: 0,
            reserved: 0,
            r,
            s: s_,
            nonce: 0,
        })
    }

    fn parse_v2_b64(s: &str) -> Result<Self, StoreError> {
        if s.len() < SHORT_HEADER_LEN_B64_V2 {
            return Err(StoreError::MalformedHeader("v2 header too short".into()));
        }
        let take = if s.len() >= HEADER_LEN_B64_V2 {
            HEADER_LEN_B64_V2
        } else {
            SHORT_HEADER_LEN_B64_V2
        };
        let raw = BASE64
            .decode(&s[..take])
            .map_err(|_| StoreError::MalformedHeader("v2 header is not base64".into()))?;
        Self::parse_v2_binary(&raw)
    }

    fn parse_v2_binary(b: &[u8]) -> Result<Self, StoreError> {
        if b.len() < SHORT_HEADER_LEN_V2 {
            return Err(StoreError::MalformedHeader("v2 header too short".into()));
        }
        if &b[..4] != MAGIC_V2 {
            return Err(StoreError::MalformedHeader("v2 magic mismatch".into()));
        }
        let mut h = Self {
            version: HeaderVersion::V2,
            time: be32(&b[4..8]),
            expire: be32(&b[8..12]),
            i: point(&b[12..45]),
            j: point(&b[45..78]),
            k: point(&b[78..111]),
            blocklen: be32(&b[111..115]),
            reserved: be64(&b[115..123]),
            r: [0u8; 32],
            s: [0u8; 32],
            nonce: 0,
        };
        if b.len() >= HEADER_LEN_V2 {
            h.r.copy_from_slice(&b[123..155]);
            h.s.copy_from_slice(&b[155..187]);
            h.nonce = ((b[187] as u64) << 32) | be32(&b[188..192]) as u64;
        }
        Ok(h)
    }

    /// Textual serialization: the v1 colon form or the v2 base64 long
    /// form, depending on the header's own version.
    pub fn serialize(&self) -> String {
        match self.version {
            HeaderVersion::V1 => self.serialize_v1(),
            HeaderVersion::V2 => BASE64.encode(self.export_binary_v2()),
        }
    }

    fn serialize_v1(&self) -> String {
        format!(
            "M0100:{:08X}:{:08X}:{}:{}:{}:{}:{}",
            self.time,
            self.expire,
            hex::encode(self.i),
            hex::encode(self.j),
            hex::encode(self.k),
            hex::encode(self.r),
            hex::encode(self.s),
        )
    }

    fn export_binary_v2(&self) -> [u8; HEADER_LEN_V2] {
        let mut out = [0u8; HEADER_LEN_V2];
        out[..4].copy_from_slice(MAGIC_V2);
        out[4..8].copy_from_slice(&self.time.to_be_bytes());
        out[8..12].copy_from_slice(&self.expire.to_be_bytes());
        out[12..45].copy_from_slice(&self.i);
        out[45..78].copy_from_slice(&self.j);
        out[78..111].copy_from_slice(&self.k);
        out[111..115].copy_from_slice(&self.blocklen.to_be_bytes());
        out[115..123].copy_from_slice(&self.reserved.to_be_bytes());
        out[123..155].copy_from_slice(&self.r);
        out[155..187].copy_from_slice(&self.s);
        out[187] = (self.nonce >> 32) as u8;
        out[188..192].copy_from_slice(&((self.nonce & 0xFFFF_FFFF) as u32).to_be_bytes());
        out
    }

    /// Byte serialization: v1 as ASCII, v2 as the raw 192-byte record.
    pub fn export_bytes(&self) -> Vec<u8> {
        match self.version {
            HeaderVersion::V1 => self.serialize_v1().into_bytes(),
            HeaderVersion::V2 => self.export_binary_v2().to_vec(),
        }
    }

    /// SHA-256 of the textual serialization.
    pub fn hash(&self) -> [u8; 32] {
        let digest = Sha256::digest(self.serialize().as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    /// Total order used for gossip listings: ascending message time,
    /// ties broken by byte order of `I`.
    pub fn time_order(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.i.cmp(&other.i))
    }

    pub fn version(&self) -> HeaderVersion {
        self.version
    }

    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn expire(&self) -> u32 {
        self.expire
    }

    pub fn i_key(&self) -> &[u8; 33] {
        &self.i
    }

    pub fn j_key(&self) -> &[u8; 33] {
        &self.j
    }

    pub fn k_key(&self) -> &[u8; 33] {
        &self.k
    }

    pub fn blocklen(&self) -> u32 {
        self.blocklen
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// JSON projection served by the REST surface.
    pub fn to_json(&self) -> MessageHeaderJson {
        MessageHeaderJson {
            version: self.version.as_str().to_string(),
            time: self.time,
            expire: self.expire,
            time_str: format_utc(self.time),
            expire_str: format_utc(self.expire),
            i: hex::encode(self.i),
            j: hex::encode(self.j),
            k: hex::encode(self.k),
            size: (self.blocklen as u64 + 1) * BLOCK_GRANULE,
            sig_r: hex::encode(self.r),
            sig_s: hex::encode(self.s),
            nonce: self.nonce,
        }
    }
}

fn hex_point(s: &str, field: &str) -> Result<[u8; 33], StoreError> {
    if s.len() != 66 {
        return Err(StoreError::MalformedHeader(format!(
            "v1 {field} field length"
        )));
    }
    let bytes = hex::decode(s)
        .map_err(|_| StoreError::MalformedHeader(format!("v1 {field} is not hex")))?;
    Ok(point(&bytes))
}

fn hex_scalar(s: &str, field: &str) -> Result<[u8; 32], StoreError> {
    if s.len() != 64 {
        return Err(StoreError::MalformedHeader(format!(
            "v1 {field} field length"
        )));
    }
    let bytes = hex::decode(s)
        .map_err(|_| StoreError::MalformedHeader(format!("v1 {field} is not hex")))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn point(b: &[u8]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out.copy_from_slice(&b[..33]);
    out
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn format_utc(unix: u32) -> String {
    match chrono::DateTime::from_timestamp(unix as i64, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// Wall clock as 32-bit unix seconds, the unit every header field uses.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}


#[cfg(test)]
mod tests {
    use super::testutil::V1_SAMPLE;
    use super::*;

    #[test]
    fn v1_parse_and_reserialize() {
        assert_eq!(V1_SAMPLE.len(), HEADER_LEN_V1);
        let h = MessageHeader::deserialize(V1_SAMPLE).expect("parse v1");
        assert_eq!(h.version(), HeaderVersion::V1);
        assert_eq!(h.time(), 0x585C_9E80);
        assert_eq!(h.expire(), 0x5860_F980);
        assert_eq!(h.i_key()[0], 0x02);
        assert_eq!(h.serialize(), V1_SAMPLE);
    }

    #[test]
    fn v1_rejects_wrong_field_count_and_version() {
        let truncated = &V1_SAMPLE[..V1_SAMPLE.rfind(':').unwrap()];
        assert!(matches!(
            MessageHeader::deserialize(truncated),
            Err(StoreError::MalformedHeader(_))
        ));
        let wrong_ver = V1_SAMPLE.replacen("M0100", "M0101", 1);
        assert!(MessageHeader::deserialize(&wrong_ver).is_err());
    }

    #[test]
    fn v1_rejects_bad_hex() {
        let bad = V1_SAMPLE.replacen("02aaaa", "02zzzz", 1);
        assert!(matches!(
            MessageHeader::deserialize(&bad),
            Err(StoreError::MalformedHeader(_))
        ));
    }

    #[test]
    fn v2_roundtrip_long_form() {
        let h = testutil::random_header(0x585C_9E80, 0x5860_F980);
        let text = h.serialize();
        assert_eq!(text.len(), HEADER_LEN_B64_V2);
        let reparsed = MessageHeader::deserialize(&text).expect("parse v2");
        assert_eq!(reparsed, h);
        assert_eq!(reparsed.serialize(), text);

        let raw = h.export_bytes();
        assert_eq!(raw.len(), HEADER_LEN_V2);
        assert_eq!(&raw[..4], b"M\x02\x00\x00");
        assert_eq!(MessageHeader::import_bytes(&raw).expect("import"), h);
    }

    #[test]
    fn v2_short_form_parses_without_signature() {
        let h = testutil::random_header(1000, 2000);
        let long = h.serialize();
        let short = &long[..SHORT_HEADER_LEN_B64_V2];
        let parsed = MessageHeader::parse_v2_b64(short).expect("short parse");
        assert_eq!(parsed.time(), 1000);
        assert_eq!(parsed.i_key(), h.i_key());
        assert_eq!(parsed.nonce(), 0);
        assert_eq!(parsed.r, [0u8; 32]);
    }

    #[test]
    fn v2_rejects_bad_magic_and_alphabet() {
        let h = testutil::random_header(1, 2);
        let mut raw = h.export_bytes();
        raw[0] = b'X';
        assert!(MessageHeader::import_bytes(&raw).is_err());

        let mut text = h.serialize();
        text.replace_range(10..11, "!");
        assert!(matches!(
            MessageHeader::deserialize(&text),
            Err(StoreError::MalformedHeader(_))
        ));
    }

    #[test]
    fn nonce_spans_forty_bits() {
        let mut h = testutil::random_header(5, 6);
        h.nonce = 0xAB_CDEF_0123;
        let parsed = MessageHeader::deserialize(&h.serialize()).expect("parse");
        assert_eq!(parsed.nonce(), 0xAB_CDEF_0123);
    }

    #[test]
    fn hash_is_stable_across_roundtrip() {
        let h = testutil::random_header(77, 99);
        let reparsed = MessageHeader::deserialize(&h.serialize()).expect("parse");
        assert_eq!(h.hash(), reparsed.hash());

        let v1 = MessageHeader::deserialize(V1_SAMPLE).expect("v1");
        let v1_again = MessageHeader::deserialize(&v1.serialize()).expect("v1 again");
        assert_eq!(v1.hash(), v1_again.hash());
    }

    #[test]
    fn time_order_is_total_on_random_sample() {
        let mut rng_headers: Vec<MessageHeader> = (0..10_000u32)
            .map(|n| testutil::random_header(n % 64, u32::MAX))
            .collect();
        rng_headers.sort_by(|a, b| a.time_order(b));
        for pair in rng_headers.windows(2) {
            let ord = pair[0].time_order(&pair[1]);
            assert_ne!(ord, Ordering::Greater);
            // antisymmetry
            assert_eq!(pair[1].time_order(&pair[0]), ord.reverse());
        }
        // irreflexivity of the strict relation: cmp with self is Equal only
        for h in rng_headers.iter().take(100) {
            assert_eq!(h.time_order(h), Ordering::Equal);
        }
    }

    #[test]
    fn json_projection_reports_derived_size() {
        let mut h = testutil::random_header(0, 1);
        h.blocklen = 3;
        let js = h.to_json();
        assert_eq!(js.size, 4 * BLOCK_GRANULE);
        assert_eq!(js.version, "0200");
        assert_eq!(js.i, hex::encode(h.i_key()));
        assert_eq!(js.time_str.len(), 19);
    }
}
