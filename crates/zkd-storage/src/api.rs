//! Control-plane contract for upload and download sessions
//!
//! Upload is three calls: initialize, confirm (repeatable), finalize.
//! Download is one listing call plus URL refresh when pre-signed URLs expire.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zkd_core::types::{b64, ChunkInfo, UploadTarget};
use zkd_core::ZkdResult;
use zkd_crypto::{KeyWrapEnvelope, ManifestFields, ManifestSignatures, SignedManifest};

/// Chunk-plan entry sent at initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChunk {
    pub index: u64,
    pub plaintext_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequest {
    /// AES-SIV encrypted object name (hex)
    pub encrypted_name: String,
    pub size: u64,
    pub mime_type: String,
    pub chunk_plan: Vec<PlannedChunk>,
    pub envelope: KeyWrapEnvelope,
    pub manifest_hash: String,
    pub signatures: ManifestSignatures,
    pub manifest_created_at: u64,
    /// Plaintext content hash bound into the manifest, when the client computed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Existing object to supersede when the caller chose "replace"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_object_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub session_id: String,
    pub object_id: String,
    /// Targets for the first batch of chunks; the rest via `fetch_upload_targets`
    #[serde(default)]
    pub upload_targets: BTreeMap<u64, UploadTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmResponse {
    pub confirmed: Vec<u64>,
    pub failed: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub manifest_hash: String,
    pub signatures: ManifestSignatures,
    pub manifest_created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub object_id: String,
    /// Manifest hash the backend stored at initialization
    pub manifest_hash: String,
}

/// A downloadable chunk: its descriptor plus a fetch URL (or object key)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChunk {
    #[serde(flatten)]
    pub info: ChunkInfo,
    pub url: String,
}

/// Manifest material needed to verify an object on the read path.
///
/// Carries no signer: readers verify against their own public keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedManifestRecord {
    pub fields: ManifestFields,
    pub signed: SignedManifest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSession {
    pub object_id: String,
    pub declared_size: u64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_name: Option<String>,
    pub chunks: Vec<DownloadChunk>,
    pub envelope: KeyWrapEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<SignedManifestRecord>,
}

/// Small encrypted metadata write (e.g. a document manifest save)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataCommit {
    #[serde(with = "b64")]
    pub encrypted_metadata: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
}

/// The external object API.
///
/// Implementations must map a naming collision to `ZkdError::Conflict`,
/// retryable transport failures to `NetworkTransient`, and everything else
/// to `Api`.
#[async_trait]
pub trait ObjectApi: Send + Sync {
    async fn initialize_session(&self, request: &InitializeRequest) -> ZkdResult<InitializeResponse>;

    /// Issue (or re-issue) upload targets for specific chunks.
    async fn fetch_upload_targets(
        &self,
        session_id: &str,
        indices: &[u64],
    ) -> ZkdResult<BTreeMap<u64, UploadTarget>>;

    /// Ask the backend to verify uploaded chunks. Safe to repeat.
    async fn confirm_chunks(&self, session_id: &str, chunks: &[ChunkInfo]) -> ZkdResult<ConfirmResponse>;

    async fn finalize_upload(&self, session_id: &str, request: &FinalizeRequest) -> ZkdResult<FinalizeResponse>;

    async fn get_download_session(&self, object_id: &str) -> ZkdResult<DownloadSession>;

    /// Fresh fetch URLs for chunks whose URLs expired.
    async fn refresh_chunk_urls(&self, object_id: &str, indices: &[u64]) -> ZkdResult<BTreeMap<u64, String>>;

    async fn commit_metadata(&self, object_id: &str, commit: &MetadataCommit) -> ZkdResult<()>;
}
