//! OpenDAL Operator factory for the direct-bucket backend

use opendal::Operator;
use zkd_core::{ZkdError, ZkdResult};

/// Minimal config needed to build an operator
/// (full config lives in zkd-core's StorageConfig)
#[derive(Clone)]
pub struct OperatorConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for OperatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Object key for one chunk of an object
pub fn chunk_key(object_id: &str, index: u64) -> String {
    format!("objects/{object_id}/chunks/{index:08}")
}

/// Build an OpenDAL Operator for any S3-compatible endpoint (path-style).
///
/// No retry layer: chunk retries are owned by the transfer retry policy.
pub fn build_operator(cfg: &OperatorConfig) -> ZkdResult<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .map_err(|e| ZkdError::Config(format!("creating OpenDAL S3 operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();

    Ok(op)
}

/// Build an operator from zkd-core config + credentials.
///
/// With `enforce_tls`, a plaintext HTTP endpoint is rejected; otherwise it
/// is allowed with a warning.
pub fn build_from_core_config(
    storage: &zkd_core::config::StorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> ZkdResult<Operator> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            return Err(ZkdError::Config(format!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled",
                storage.endpoint
            )));
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP; set storage.enforce_tls = true and use HTTPS in production"
        );
    }

    build_operator(&OperatorConfig {
        endpoint: storage.endpoint.clone(),
        region: storage.region.clone(),
        bucket: storage.bucket.clone(),
        access_key_id: access_key_id.to_string(),
        secret_access_key: secret_access_key.to_string(),
    })
}
