//! Property-based tests for ciphertext framing and error classification.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;

use aws_encryption_provider::error::{ErrorKind, KmsError, ProviderError};
use aws_encryption_provider::health::{
    SharedHealthCheck, DEFAULT_ERR_BUF_SIZE, DEFAULT_HEALTH_CHECK_PERIOD,
};
use aws_encryption_provider::kms::{KmsClient, MockKmsClient};
use aws_encryption_provider::plugin::{V1Plugin, V2Plugin, STORAGE_VERSION};

/// KMS double whose encrypt/decrypt are an identity pair: the "blob" is the
/// plaintext itself. Framing is then the only transformation the plugins add.
struct IdentityKms;

#[async_trait]
impl KmsClient for IdentityKms {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        _key_id: &str,
        _encryption_context: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, KmsError> {
        Ok(plaintext.to_vec())
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        _encryption_context: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, KmsError> {
        Ok(ciphertext.to_vec())
    }
}

fn health_check() -> Arc<SharedHealthCheck> {
    Arc::new(SharedHealthCheck::new(
        DEFAULT_HEALTH_CHECK_PERIOD,
        DEFAULT_ERR_BUF_SIZE,
    ))
}

fn v1_identity() -> V1Plugin {
    V1Plugin::new("prop-key", Arc::new(IdentityKms), HashMap::new(), health_check())
}

fn v2_identity() -> V2Plugin {
    V2Plugin::new("prop-key", Arc::new(IdentityKms), HashMap::new(), health_check())
}

const KNOWN_CODES: &[&str] = &[
    "DisabledException",
    "KMSInvalidStateException",
    "KeyUnavailableException",
    "InvalidArnException",
    "InvalidGrantIdException",
    "InvalidGrantTokenException",
    "LimitExceededException",
    "RequestLimitExceeded",
    "ThrottlingException",
    "InvalidCiphertextException",
    "AccessDeniedException",
    "KMSInternalException",
];

fn error_code() -> impl Strategy<Value = String> {
    prop_oneof![
        proptest::sample::select(KNOWN_CODES).prop_map(str::to_string),
        "[A-Za-z]{1,24}",
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // Decrypt(Encrypt(P)) == P for all plaintexts, on both protocol versions.
    #[test]
    fn prop_round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..256)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let v1 = v1_identity();
            let cipher = v1.encrypt(&plaintext).await.unwrap();
            prop_assert_eq!(v1.decrypt(&cipher).await.unwrap(), plaintext.clone());

            let v2 = v2_identity();
            let ciphertext = v2.encrypt(&plaintext).await.unwrap();
            prop_assert_eq!(v2.decrypt(&ciphertext).await.unwrap(), plaintext);
            Ok(())
        })?;
    }

    // Every produced ciphertext starts with the storage-version tag.
    #[test]
    fn prop_ciphertext_is_tagged(plaintext in proptest::collection::vec(any::<u8>(), 0..256)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let cipher = v1_identity().encrypt(&plaintext).await.unwrap();
            prop_assert_eq!(cipher[0], STORAGE_VERSION);
            prop_assert_eq!(&cipher[1..], plaintext.as_slice());

            let ciphertext = v2_identity().encrypt(&plaintext).await.unwrap();
            prop_assert_eq!(ciphertext[0], STORAGE_VERSION);
            Ok(())
        })?;
    }

    // v1 forwards any untagged ciphertext to KMS byte for byte.
    #[test]
    fn prop_v1_forwards_untagged_input(
        first in any::<u8>().prop_filter("untagged", |b| *b != STORAGE_VERSION),
        rest in proptest::collection::vec(any::<u8>(), 0..128),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut cipher = vec![first];
            cipher.extend_from_slice(&rest);

            let mock = Arc::new(MockKmsClient::new());
            mock.set_decrypt_resp(b"plain".as_slice(), None);
            let plugin = V1Plugin::new("prop-key", mock.clone(), HashMap::new(), health_check());

            plugin.decrypt(&cipher).await.unwrap();
            prop_assert_eq!(mock.decrypt_calls()[0].ciphertext.clone(), cipher);
            Ok(())
        })?;
    }

    // v2 rejects any untagged ciphertext before KMS is involved.
    #[test]
    fn prop_v2_rejects_untagged_input(
        first in any::<u8>().prop_filter("untagged", |b| *b != STORAGE_VERSION),
        rest in proptest::collection::vec(any::<u8>(), 0..128),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut ciphertext = vec![first];
            ciphertext.extend_from_slice(&rest);

            let mock = Arc::new(MockKmsClient::new());
            mock.set_decrypt_resp(b"plain".as_slice(), None);
            let plugin = V2Plugin::new("prop-key", mock.clone(), HashMap::new(), health_check());

            let err = plugin.decrypt(&ciphertext).await.unwrap_err();
            prop_assert_eq!(err, ProviderError::VersionMismatch(first));
            prop_assert!(mock.decrypt_calls().is_empty());
            Ok(())
        })?;
    }

    // Wrapping an error once never changes its classification.
    #[test]
    fn prop_classification_is_wrapping_invariant(
        code in error_code(),
        message in "[a-zA-Z0-9 :]{0,60}",
    ) {
        let err = KmsError::api(code, message);
        let bare = ErrorKind::of(&err);
        prop_assert_eq!(ErrorKind::of(&ProviderError::Encrypt(err.clone())), bare);
        prop_assert_eq!(ErrorKind::of(&ProviderError::Decrypt(err)), bare);
    }
}
