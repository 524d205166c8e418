//! reqwest-backed object API client and pre-signed URL transport

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zkd_core::config::ApiConfig;
use zkd_core::types::{ChunkInfo, ConflictInfo, UploadTarget};
use zkd_core::{ZkdError, ZkdResult};

use crate::api::{
    ConfirmResponse, DownloadSession, FinalizeRequest, FinalizeResponse, InitializeRequest,
    InitializeResponse, MetadataCommit, ObjectApi,
};
use crate::transport::BlobTransport;

/// Header carrying the SHA-256 body digest on checksummed PUTs
pub const CHECKSUM_HEADER: &str = "x-amz-checksum-sha256";

fn map_reqwest(e: reqwest::Error) -> ZkdError {
    if e.is_decode() {
        ZkdError::Serialization(e.to_string())
    } else if e.is_builder() {
        ZkdError::Config(e.to_string())
    } else {
        // timeouts, refused connections, resets
        ZkdError::NetworkTransient(e.to_string())
    }
}

async fn error_body(resp: Response) -> String {
    resp.text().await.unwrap_or_default()
}

/// Map a non-success control-plane response to the error taxonomy.
async fn api_error(resp: Response) -> ZkdError {
    let status = resp.status();
    let body = error_body(resp).await;
    match status {
        StatusCode::CONFLICT => match serde_json::from_str::<ConflictInfo>(&body) {
            Ok(info) => ZkdError::Conflict(info),
            Err(_) => ZkdError::Api {
                status: status.as_u16(),
                message: body,
            },
        },
        s if s.is_server_error()
            || s == StatusCode::REQUEST_TIMEOUT
            || s == StatusCode::TOO_MANY_REQUESTS =>
        {
            ZkdError::NetworkTransient(format!("HTTP {}: {body}", s.as_u16()))
        }
        s => ZkdError::Api {
            status: s.as_u16(),
            message: body,
        },
    }
}

/// Map a non-success blob response. Object stores answer an expired
/// pre-signed URL with 403.
async fn blob_error(resp: Response) -> ZkdError {
    let status = resp.status();
    match status {
        StatusCode::FORBIDDEN | StatusCode::GONE => ZkdError::UrlExpired,
        s if s.is_server_error()
            || s == StatusCode::REQUEST_TIMEOUT
            || s == StatusCode::TOO_MANY_REQUESTS =>
        {
            ZkdError::NetworkTransient(format!("HTTP {}", s.as_u16()))
        }
        StatusCode::RANGE_NOT_SATISFIABLE | StatusCode::NOT_FOUND => ZkdError::Storage(format!(
            "HTTP {}: {}",
            status.as_u16(),
            error_body(resp).await
        )),
        s => ZkdError::Api {
            status: s.as_u16(),
            message: error_body(resp).await,
        },
    }
}

/// HTTP client for the object API.
#[derive(Clone)]
pub struct HttpObjectApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for HttpObjectApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpObjectApi")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Serialize)]
struct IndicesBody<'a> {
    indices: &'a [u64],
}

#[derive(Serialize)]
struct ConfirmBody<'a> {
    chunks: &'a [ChunkInfo],
}

#[derive(Deserialize)]
struct TargetsBody {
    targets: BTreeMap<u64, UploadTarget>,
}

#[derive(Deserialize)]
struct UrlsBody {
    urls: BTreeMap<u64, String>,
}

impl HttpObjectApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> ZkdResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ZkdError::Config(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build from config, reading the bearer token from `api.token_env`.
    pub fn from_config(cfg: &ApiConfig) -> ZkdResult<Self> {
        let token = std::env::var(&cfg.token_env).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            tracing::warn!(env = %cfg.token_env, "no API token set; requests are unauthenticated");
        }
        Self::new(
            cfg.endpoint.clone(),
            token,
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(&self, path: &str, body: &B) -> ZkdResult<R> {
        debug!("POST {path}");
        let resp = self
            .authed(self.client.post(self.url(path)).json(body))
            .send()
            .await
            .map_err(map_reqwest)?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        resp.json().await.map_err(map_reqwest)
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> ZkdResult<R> {
        debug!("GET {path}");
        let resp = self
            .authed(self.client.get(self.url(path)))
            .send()
            .await
            .map_err(map_reqwest)?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        resp.json().await.map_err(map_reqwest)
    }
}

#[async_trait]
impl ObjectApi for HttpObjectApi {
    async fn initialize_session(&self, request: &InitializeRequest) -> ZkdResult<InitializeResponse> {
        self.post_json("/v1/uploads", request).await
    }

    async fn fetch_upload_targets(
        &self,
        session_id: &str,
        indices: &[u64],
    ) -> ZkdResult<BTreeMap<u64, UploadTarget>> {
        let body: TargetsBody = self
            .post_json(&format!("/v1/uploads/{session_id}/targets"), &IndicesBody { indices })
            .await?;
        Ok(body.targets)
    }

    async fn confirm_chunks(&self, session_id: &str, chunks: &[ChunkInfo]) -> ZkdResult<ConfirmResponse> {
        self.post_json(&format!("/v1/uploads/{session_id}/confirm"), &ConfirmBody { chunks })
            .await
    }

    async fn finalize_upload(&self, session_id: &str, request: &FinalizeRequest) -> ZkdResult<FinalizeResponse> {
        self.post_json(&format!("/v1/uploads/{session_id}/finalize"), request)
            .await
    }

    async fn get_download_session(&self, object_id: &str) -> ZkdResult<DownloadSession> {
        self.get_json(&format!("/v1/objects/{object_id}/download")).await
    }

    async fn refresh_chunk_urls(&self, object_id: &str, indices: &[u64]) -> ZkdResult<BTreeMap<u64, String>> {
        let body: UrlsBody = self
            .post_json(&format!("/v1/objects/{object_id}/urls"), &IndicesBody { indices })
            .await?;
        Ok(body.urls)
    }

    async fn commit_metadata(&self, object_id: &str, commit: &MetadataCommit) -> ZkdResult<()> {
        let path = format!("/v1/objects/{object_id}/metadata");
        debug!("PUT {path}");
        let resp = self
            .authed(self.client.put(self.url(&path)).json(commit))
            .send()
            .await
            .map_err(map_reqwest)?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(())
    }
}

/// Blob transport over pre-signed URLs.
///
/// Kept on its own `Client` so bulk transfers never share a connection
/// pool with control-plane calls.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> ZkdResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ZkdError::Config(format!("building transfer client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BlobTransport for HttpTransport {
    async fn put(&self, target: &UploadTarget, body: Bytes, content_digest: &str) -> ZkdResult<()> {
        let mut req = self
            .client
            .put(&target.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream");
        if target.expected_digest.is_some() {
            req = req.header(CHECKSUM_HEADER, content_digest);
        }
        let resp = req.body(body).send().await.map_err(map_reqwest)?;
        if !resp.status().is_success() {
            return Err(blob_error(resp).await);
        }
        Ok(())
    }

    async fn get(&self, url: &str) -> ZkdResult<Bytes> {
        let resp = self.client.get(url).send().await.map_err(map_reqwest)?;
        if !resp.status().is_success() {
            return Err(blob_error(resp).await);
        }
        resp.bytes().await.map_err(map_reqwest)
    }
}
