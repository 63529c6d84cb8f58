// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! REST surface of the node.  Every route here is also consumed by
//! peers through `HttpPeerApi`, so shapes and paths are protocol, not
//! presentation.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use deaddrop_core::{
    unix_now, HeaderListResponse, MessageListResponse, MessageStore, MessageUploadResponse,
    PeerItemResponse, StoreError, TimeResponse,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::ws_net;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MessageStore>,
}

pub fn router(store: Arc<MessageStore>) -> Router {
    Router::new()
        .route("/api/v2/time", get(get_time))
        .route("/api/v2/status", get(get_status))
        .route("/api/v2/headers", get(get_headers))
        .route("/api/v2/headers/:msgid", get(get_header_info))
        .route("/api/v2/messages", get(get_messages).post(upload_message))
        .route("/api/v2/messages/:msgid", get(download_message))
        .route("/api/v2/peers", get(get_peers).post(add_peer))
        .route("/wsapi/v2/ws/", get(ws_upgrade))
        .with_state(AppState { store })
}

fn status_for(e: &StoreError) -> StatusCode {
    match e {
        StoreError::MalformedHeader(_)
        | StoreError::Duplicate
        | StoreError::Expired
        | StoreError::OutOfSector => StatusCode::BAD_REQUEST,
        StoreError::NotFound => StatusCode::NOT_FOUND,
        StoreError::Transport(_) => StatusCode::BAD_GATEWAY,
        StoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply_err(e: StoreError) -> Response {
    if matches!(e, StoreError::Storage(_)) {
        warn!(%e, "request failed");
    } else {
        debug!(%e, "request rejected");
    }
    (status_for(&e), e.to_string()).into_response()
}

fn parse_ihex(msgid: &str) -> Result<[u8; 33], StoreError> {
    let bytes = hex::decode(msgid)
        .map_err(|_| StoreError::MalformedHeader("identifier is not hex".into()))?;
    if bytes.len() != 33 {
        return Err(StoreError::MalformedHeader(
            "identifier must be 33 bytes".into(),
        ));
    }
    let mut i = [0u8; 33];
    i.copy_from_slice(&bytes);
    Ok(i)
}

#[derive(Deserialize)]
struct SinceQuery {
    since: Option<u32>,
}

#[derive(Deserialize)]
struct DownloadQuery {
    recurse: Option<String>,
}

async fn get_time() -> Json<TimeResponse> {
    Json(TimeResponse { time: unix_now() })
}

async fn get_status(State(state): State<AppState>) -> Response {
    Json(state.store.status()).into_response()
}

async fn get_headers(
    State(state): State<AppState>,
    Query(query): Query<SinceQuery>,
) -> Response {
    match state
        .store
        .local_cache()
        .find_since(query.since.unwrap_or(0))
    {
        Ok(cached) => Json(HeaderListResponse {
            headers: cached.iter().map(|c| c.header.serialize()).collect(),
        })
        .into_response(),
        Err(e) => reply_err(e),
    }
}

async fn get_header_info(
    State(state): State<AppState>,
    Path(msgid): Path<String>,
) -> Response {
    let i = match parse_ihex(&msgid) {
        Ok(i) => i,
        Err(e) => return reply_err(e),
    };
    match state.store.find_by_i(&i) {
        Ok(Some(found)) => Json(found.header.to_json()).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => reply_err(e),
    }
}

async fn get_messages(
    State(state): State<AppState>,
    Query(query): Query<SinceQuery>,
) -> Response {
    match state.store.find_since(query.since.unwrap_or(0)) {
        Ok(found) => Json(MessageListResponse {
            messages: found.iter().map(|m| hex::encode(m.header.i_key())).collect(),
        })
        .into_response(),
        Err(e) => reply_err(e),
    }
}

async fn download_message(
    State(state): State<AppState>,
    Path(msgid): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let i = match parse_ihex(&msgid) {
        Ok(i) => i,
        Err(e) => return reply_err(e),
    };
    // recurse=false limits the lookup to local blobs, which is what
    // peers use so blob pulls never chain through a third node
    let local_only = query
        .recurse
        .as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case("false"));
    let found = if local_only {
        state.store.find_by_i(&i)
    } else {
        state.store.find_or_fetch_by_i(&i).await
    };
    match found {
        Ok(Some(m)) => match tokio::fs::read(&m.filepath).await {
            Ok(bytes) => (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                bytes,
            )
                .into_response(),
            Err(e) => reply_err(StoreError::Storage(e.to_string())),
        },
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => reply_err(e),
    }
}

async fn upload_message(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    let field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("message") => break field,
            Ok(Some(_)) => continue,
            Ok(None) => {
                return (StatusCode::BAD_REQUEST, "missing message field").into_response()
            }
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        }
    };
    let bytes = match field.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let staging = state.store.staging_path();
    if let Err(e) = tokio::fs::write(&staging, &bytes).await {
        return reply_err(StoreError::Storage(e.to_string()));
    }
    let mut message = match state.store.ingest(&staging) {
        Ok(m) => m,
        Err(e) => {
            let _ = tokio::fs::remove_file(&staging).await;
            return reply_err(e);
        }
    };

    let dest = state.store.blob_dest(message.header.i_key());
    if let Err(e) = message.promote(&dest) {
        return reply_err(e);
    }
    match state.store.insert_file(&dest) {
        Ok(servertime) => Json(MessageUploadResponse {
            header: message.header.serialize(),
            servertime,
        })
        .into_response(),
        Err(e) => reply_err(e),
    }
}

async fn get_peers(State(state): State<AppState>) -> Json<Vec<PeerItemResponse>> {
    Json(state.store.local_cache().list_peers())
}

async fn add_peer(
    State(state): State<AppState>,
    Json(item): Json<PeerItemResponse>,
) -> Response {
    match state.store.local_cache().add_peer(&item.host, item.port) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => reply_err(e),
    }
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let store = state.store.clone();
    ws.on_upgrade(move |socket| ws_net::serve_inbound(store, socket))
}
