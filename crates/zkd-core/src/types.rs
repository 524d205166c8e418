use serde::{Deserialize, Serialize};

/// Compression codec applied to a chunk before encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Zstd,
}

/// Per-chunk compression record, present only when the stored bytes are compressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionMeta {
    pub algorithm: CompressionAlgorithm,
    pub original_size: u64,
    pub compressed_size: u64,
}

/// Upper bound on a single chunk's plaintext, on both the write and read paths
pub const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

/// Encrypted chunk descriptor shared by the upload and download paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Zero-based, contiguous chunk index
    pub index: u64,
    /// Plaintext bytes covered by this chunk
    pub plaintext_size: u64,
    /// Stored ciphertext length including the AEAD tag
    pub encrypted_size: u64,
    /// AEAD nonce (base64 on the wire)
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// BLAKE3 of the ciphertext (hex)
    pub integrity_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionMeta>,
}

impl ChunkInfo {
    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }
}

/// Where a single chunk's ciphertext must be PUT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTarget {
    pub url: String,
    /// Digest algorithm the backend verifies the PUT body with (`"sha256"`), if any.
    /// When set, the upload carries the chunk's SHA-256 content digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<String>,
}

/// Structured payload of a naming conflict (409) response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Name the upload attempted to use
    pub conflicting_name: String,
    /// Object currently holding that name
    pub existing_object_id: String,
    /// Server-suggested alternative, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_name: Option<String>,
}

/// Caller decision for a naming conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Supersede the existing object
    Replace,
    /// Upload under the next free `name (n).ext`
    KeepBoth,
    /// Abandon this upload
    Skip,
}

/// Base64 (standard alphabet) serde adapter for byte vectors
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch
pub fn unix_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_info_wire_shape() {
        let info = ChunkInfo {
            index: 3,
            plaintext_size: 100,
            encrypted_size: 76,
            nonce: vec![1, 2, 3],
            integrity_digest: "ab".into(),
            compression: Some(CompressionMeta {
                algorithm: CompressionAlgorithm::Zstd,
                original_size: 100,
                compressed_size: 60,
            }),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["nonce"], "AQID");
        assert_eq!(json["compression"]["algorithm"], "zstd");

        let back: ChunkInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn uncompressed_chunk_omits_compression() {
        let info = ChunkInfo {
            index: 0,
            plaintext_size: 4,
            encrypted_size: 20,
            nonce: vec![0; 24],
            integrity_digest: "00".into(),
            compression: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("compression"));
        assert!(!info.is_compressed());
    }

    #[test]
    fn resolution_kebab_case() {
        let r: ConflictResolution = serde_json::from_str("\"keep-both\"").unwrap();
        assert_eq!(r, ConflictResolution::KeepBoth);
    }
}
