//! Blob transfer abstraction
//!
//! A chunk's ciphertext is PUT to an upload target and later fetched by
//! URL. With the pre-signed backend these are HTTP URLs; with the
//! direct-bucket backend they are object keys in an OpenDAL operator.

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use zkd_core::types::UploadTarget;
use zkd_core::{ZkdError, ZkdResult};

#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Store `body` at `target`. `content_digest` is the SHA-256 (base64) of `body`.
    async fn put(&self, target: &UploadTarget, body: Bytes, content_digest: &str) -> ZkdResult<()>;

    async fn get(&self, url: &str) -> ZkdResult<Bytes>;
}

pub(crate) fn map_opendal(e: opendal::Error) -> ZkdError {
    if e.is_temporary() {
        return ZkdError::NetworkTransient(e.to_string());
    }
    match e.kind() {
        ErrorKind::PermissionDenied => ZkdError::UrlExpired,
        ErrorKind::RateLimited => ZkdError::NetworkTransient(e.to_string()),
        _ => ZkdError::Storage(e.to_string()),
    }
}

/// Direct-bucket transport: targets and URLs are object keys.
#[derive(Debug, Clone)]
pub struct OperatorTransport {
    op: Operator,
}

impl OperatorTransport {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

#[async_trait]
impl BlobTransport for OperatorTransport {
    async fn put(&self, target: &UploadTarget, body: Bytes, _content_digest: &str) -> ZkdResult<()> {
        let len = body.len();
        self.op.write(&target.url, body).await.map_err(map_opendal)?;
        tracing::trace!(key = %target.url, bytes = len, "chunk written");
        Ok(())
    }

    async fn get(&self, url: &str) -> ZkdResult<Bytes> {
        let buf = self.op.read(url).await.map_err(map_opendal)?;
        Ok(buf.to_bytes())
    }
}
