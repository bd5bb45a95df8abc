//! KMS client abstraction.
//!
//! The rest of the provider only ever sees the two-method [`KmsClient`]
//! surface. [`aws::AwsKmsClient`] talks to the real service;
//! [`mock::MockKmsClient`] backs the tests.

pub mod aws;
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;

pub use crate::error::KmsError;
pub use aws::AwsKmsClient;
pub use mock::MockKmsClient;

/// Minimal KMS surface consumed by the plugins.
///
/// Both calls honor future cancellation; the encryption context, when
/// present, becomes part of the authenticated associated data and must match
/// between encrypt and decrypt.
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// Encrypts `plaintext` under `key_id`.
    async fn encrypt(
        &self,
        plaintext: &[u8],
        key_id: &str,
        encryption_context: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, KmsError>;

    /// Decrypts a ciphertext blob previously produced by [`Self::encrypt`].
    async fn decrypt(
        &self,
        ciphertext: &[u8],
        encryption_context: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, KmsError>;
}
