//! AWS KMS envelope encryption provider for Kubernetes API servers.
//!
//! A sidecar that serves the v1beta1 and v2 encryption-provider RPC APIs over
//! Unix-domain sockets, brokering every call to AWS KMS under a configured
//! customer master key. Ciphertexts are framed with a one-byte
//! storage-version tag, health state is shared across both protocol plugins,
//! and readiness/liveness/metrics are exposed over HTTP.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod health;
pub mod kms;
pub mod metrics;
pub mod plugin;
pub mod probe;
pub mod server;
pub mod shutdown;

/// Generated RPC bindings.
pub mod proto {
    /// v1beta1 envelope encryption RPC API.
    pub mod v1beta1 {
        #![allow(missing_docs)]
        tonic::include_proto!("v1beta1");
    }

    /// v2 envelope encryption RPC API.
    pub mod v2 {
        #![allow(missing_docs)]
        tonic::include_proto!("v2");
    }
}

pub use config::Config;
pub use error::{ErrorKind, KmsError, ProviderError};
pub use health::SharedHealthCheck;
pub use plugin::{V1Plugin, V2Plugin};
