//! zkd-storage: the network side of object transfer
//!
//! - `api`: the control-plane contract (sessions, targets, confirm, finalize)
//! - `http`: reqwest implementation of that contract and the pre-signed URL transport
//! - `transport`: blob PUT/GET abstraction, with an OpenDAL direct-bucket backend
//! - `operator`: OpenDAL operator factory for S3-compatible stores
//! - `scheduler`: bounded FIFO executor reserved for bulk chunk transfer

pub mod api;
pub mod http;
pub mod operator;
pub mod scheduler;
pub mod transport;

pub use api::{
    ConfirmResponse, DownloadChunk, DownloadSession, FinalizeRequest, FinalizeResponse,
    InitializeRequest, InitializeResponse, MetadataCommit, ObjectApi, PlannedChunk, SignedManifestRecord,
};
pub use http::{HttpObjectApi, HttpTransport};
pub use operator::{build_from_core_config, build_operator, chunk_key, OperatorConfig};
pub use scheduler::{TransferPermit, TransferScheduler};
pub use transport::{BlobTransport, OperatorTransport};
