//! The encryption-provider plugins.
//!
//! Two protocol generations share one KMS client, one metric registry, and
//! one health state. Ciphertext produced by either carries the one-byte
//! storage-version tag so format generations can be told apart on decrypt.

pub mod v1;
pub mod v2;

pub use v1::V1Plugin;
pub use v2::V2Plugin;

/// Storage-version tag prefixed to every ciphertext this provider produces.
pub const STORAGE_VERSION: u8 = b'1';

/// Sentinel plaintext used by on-demand health probes.
pub(crate) const HEALTH_PROBE_PLAINTEXT: &[u8] = b"foo";

/// Runtime name reported by the v1 `Version` RPC.
pub const RUNTIME_NAME: &str = "aws-encryption-provider";

/// Runtime version reported by the v1 `Version` RPC.
pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");
