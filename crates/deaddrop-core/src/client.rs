// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! HTTP client for a peer's REST surface.
//!
//! Every node exposes the same `/api/v2/` surface it consumes, so one
//! trait covers both directions.  Transport failures are non-fatal by
//! design: the caller leaves its pull watermark untouched and retries
//! the same window on the next sync tick.

use std::time::Duration;

use async_trait::async_trait;

use crate::dto::{
    HeaderListResponse, MessageHeaderJson, PeerItemResponse, StatusResponse, TimeResponse,
};
use crate::error::{Result, StoreError};
use crate::header::MessageHeader;

#[async_trait]
pub trait PeerApi: Send + Sync {
    async fn get_time(&self, host: &str, port: u16) -> Result<u32>;
    async fn get_status(&self, host: &str, port: u16) -> Result<StatusResponse>;
    async fn get_headers_since(
        &self,
        host: &str,
        port: u16,
        since: u32,
    ) -> Result<Vec<MessageHeader>>;
    async fn get_header(
        &self,
        host: &str,
        port: u16,
        i: &[u8; 33],
    ) -> Result<Option<MessageHeaderJson>>;
    async fn get_message(&self, host: &str, port: u16, i: &[u8; 33]) -> Result<Vec<u8>>;
    async fn get_peers(&self, host: &str, port: u16) -> Result<Vec<PeerItemResponse>>;
    async fn post_peer(&self, host: &str, port: u16, item: &PeerItemResponse) -> Result<()>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpPeerApi {
    http: reqwest::Client,
}

impl HttpPeerApi {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self { http })
    }

    fn url(host: &str, port: u16, tail: &str) -> String {
        format!("http://{host}:{port}/api/v2/{tail}")
    }
}

#[async_trait]
impl PeerApi for HttpPeerApi {
    async fn get_time(&self, host: &str, port: u16) -> Result<u32> {
        let resp: TimeResponse = self
            .http
            .get(Self::url(host, port, "time"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.time)
    }

    async fn get_status(&self, host: &str, port: u16) -> Result<StatusResponse> {
        Ok(self
            .http
            .get(Self::url(host, port, "status"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn get_headers_since(
        &self,
        host: &str,
        port: u16,
        since: u32,
    ) -> Result<Vec<MessageHeader>> {
        let resp: HeaderListResponse = self
            .http
            .get(Self::url(host, port, &format!("headers?since={since}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut headers = Vec::with_capacity(resp.headers.len());
        for text in resp.headers {
            match MessageHeader::deserialize(&text) {
                Ok(h) => headers.push(h),
                // one peer's bad record must not poison the whole pull
                Err(e) => tracing::warn!(peer = %host, %e, "skipping unparseable header"),
            }
        }
        Ok(headers)
    }

    async fn get_header(
        &self,
        host: &str,
        port: u16,
        i: &[u8; 33],
    ) -> Result<Option<MessageHeaderJson>> {
        let resp = self
            .http
            .get(Self::url(host, port, &format!("headers/{}", hex::encode(i))))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json().await?))
    }

    async fn get_message(&self, host: &str, port: u16, i: &[u8; 33]) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(Self::url(
                host,
                port,
                &format!("messages/{}?recurse=false", hex::encode(i)),
            ))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        Ok(resp.error_for_status()?.bytes().await?.to_vec())
    }

    async fn get_peers(&self, host: &str, port: u16) -> Result<Vec<PeerItemResponse>> {
        Ok(self
            .http
            .get(Self::url(host, port, "peers"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn post_peer(&self, host: &str, port: u16, item: &PeerItemResponse) -> Result<()> {
        self.http
            .post(Self::url(host, port, "peers"))
            .json(item)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
