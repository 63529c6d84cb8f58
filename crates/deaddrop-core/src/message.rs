// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! One persisted message blob: the file, its parsed header and the time
//! this node first saw it.

use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::header::{MessageHeader, HEADER_LEN_V1, HEADER_LEN_V2};

/// A message blob on disk.  The header is the file's leading bytes; the
/// body is opaque ciphertext and never interpreted here.
#[derive(Debug, Clone)]
pub struct MessageFile {
    pub header: MessageHeader,
    pub servertime: u32,
    pub filepath: PathBuf,
}

impl MessageFile {
    /// Parse the header out of a file without inserting it anywhere.
    /// The body length is not checked against `blocklen`.
    pub fn ingest(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(StoreError::MalformedHeader("empty message file".into()));
        }
        let take = if bytes.get(..3) == Some(b"M01") {
            HEADER_LEN_V1
        } else {
            HEADER_LEN_V2
        };
        if bytes.len() < take {
            return Err(StoreError::MalformedHeader(
                "message file shorter than its header".into(),
            ));
        }
        let header = MessageHeader::import_bytes(&bytes[..take])?;
        Ok(Self {
            header,
            servertime: 0,
            filepath: path.to_path_buf(),
        })
    }

    /// Promote the blob to `dest`, creating parent directories.  Rename
    /// first; fall back to copy-and-unlink for cross-device staging.
    pub fn promote(&mut self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if std::fs::rename(&self.filepath, dest).is_err() {
            std::fs::copy(&self.filepath, dest)?;
            std::fs::remove_file(&self.filepath)?;
        }
        self.filepath = dest.to_path_buf();
        Ok(())
    }
}

/// Canonical blob location: `<store>/<Ihex[0..4]>/<Ihex>`.
pub fn blob_path(store_dir: &Path, i: &[u8; 33]) -> PathBuf {
    let ihex = hex::encode(i);
    store_dir.join(&ihex[..4]).join(&ihex)
}
