//! v2 encryption-provider plugin.
//!
//! Strict on decrypt input: the storage-version tag is mandatory, and a
//! mismatch fails locally without touching KMS.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};
use tracing::{debug, error, warn};

use crate::error::{ErrorKind, ProviderError};
use crate::health::SharedHealthCheck;
use crate::kms::KmsClient;
use crate::metrics::{self, OPERATION_DECRYPT, OPERATION_ENCRYPT};
use crate::proto::v2::key_management_service_server::KeyManagementService;
use crate::proto::v2::{
    DecryptRequest, DecryptResponse, EncryptRequest, EncryptResponse, StatusRequest,
    StatusResponse,
};

use super::{HEALTH_PROBE_PLAINTEXT, STORAGE_VERSION};

/// API version string reported by the `Status` RPC.
pub const API_VERSION: &str = "v2beta1";

const VERSION_LABEL: &str = "v2";

/// v2 plugin instance. Cheap to clone; all mutable state lives in the shared
/// health check.
#[derive(Clone)]
pub struct V2Plugin {
    kms: Arc<dyn KmsClient>,
    key_id: String,
    encryption_context: HashMap<String, String>,
    health_check: Arc<SharedHealthCheck>,
}

impl V2Plugin {
    /// Creates a plugin serving the given CMK through `kms`.
    pub fn new(
        key_id: impl Into<String>,
        kms: Arc<dyn KmsClient>,
        encryption_context: HashMap<String, String>,
        health_check: Arc<SharedHealthCheck>,
    ) -> Self {
        Self {
            kms,
            key_id: key_id.into(),
            encryption_context,
            health_check,
        }
    }

    fn context(&self) -> Option<&HashMap<String, String>> {
        if self.encryption_context.is_empty() {
            None
        } else {
            Some(&self.encryption_context)
        }
    }

    /// Encrypts `plaintext` under the configured CMK and frames the result
    /// with the storage-version tag.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProviderError> {
        debug!("starting encrypt operation");
        let started = Instant::now();

        match self.kms.encrypt(plaintext, &self.key_id, self.context()).await {
            Ok(blob) => {
                debug!("encrypt operation successful");
                metrics::record_operation(&self.key_id, OPERATION_ENCRYPT, VERSION_LABEL, None, started);
                let mut ciphertext = Vec::with_capacity(blob.len() + 1);
                ciphertext.push(STORAGE_VERSION);
                ciphertext.extend_from_slice(&blob);
                Ok(ciphertext)
            }
            Err(err) => {
                let err = ProviderError::Encrypt(err);
                self.health_check.notify(err.clone());
                error!(error_type = %ErrorKind::of(&err), error = %err, "request to encrypt failed");
                metrics::record_operation(
                    &self.key_id,
                    OPERATION_ENCRYPT,
                    VERSION_LABEL,
                    Some(&err),
                    started,
                );
                Err(err)
            }
        }
    }

    /// Decrypts `ciphertext`. The first byte must be the storage-version tag;
    /// anything else is rejected before KMS is involved.
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ProviderError> {
        debug!("starting decrypt operation");
        let started = Instant::now();

        let stripped = match ciphertext.split_first() {
            Some((&STORAGE_VERSION, rest)) => rest,
            Some((&tag, _)) => {
                let err = ProviderError::VersionMismatch(tag);
                metrics::record_operation(&self.key_id, OPERATION_DECRYPT, VERSION_LABEL, Some(&err), started);
                return Err(err);
            }
            None => {
                let err = ProviderError::EmptyCiphertext;
                metrics::record_operation(&self.key_id, OPERATION_DECRYPT, VERSION_LABEL, Some(&err), started);
                return Err(err);
            }
        };

        match self.kms.decrypt(stripped, self.context()).await {
            Ok(plaintext) => {
                debug!("decrypt operation successful");
                metrics::record_operation(&self.key_id, OPERATION_DECRYPT, VERSION_LABEL, None, started);
                Ok(plaintext)
            }
            Err(err) => {
                let err = ProviderError::Decrypt(err);
                self.health_check.notify(err.clone());
                error!(error_type = %ErrorKind::of(&err), error = %err, "request to decrypt failed");
                metrics::record_operation(
                    &self.key_id,
                    OPERATION_DECRYPT,
                    VERSION_LABEL,
                    Some(&err),
                    started,
                );
                Err(err)
            }
        }
    }

    /// Reports the most recent available KMS liveness signal; see
    /// [`crate::plugin::V1Plugin::health`] for the probing rules.
    pub async fn health(&self) -> Result<(), ProviderError> {
        let (recent, cached) = self.health_check.is_recently_checked().await;
        if !recent {
            let probe = self.clone();
            let outcome = tokio::spawn(async move {
                let result = probe.encrypt(HEALTH_PROBE_PLAINTEXT).await.map(|_| ());
                probe.health_check.record_err(result.as_ref().err().cloned()).await;
                result
            })
            .await;
            return match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    warn!(error = %err, "health check failed");
                    Err(err)
                }
                Err(join_err) => Err(ProviderError::Probe(join_err.to_string())),
            };
        }

        match cached {
            Some(err) => {
                warn!(error = %err, "health check failed");
                Err(err)
            }
            None => {
                debug!("health check success");
                Ok(())
            }
        }
    }

    /// Liveness probe: user-induced failures report healthy.
    pub async fn live(&self) -> Result<(), ProviderError> {
        if let Err(err) = self.health().await {
            if ErrorKind::of(&err) != ErrorKind::UserInduced {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl KeyManagementService for V2Plugin {
    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let healthz = if self.health().await.is_ok() { "ok" } else { "err" };
        Ok(Response::new(StatusResponse {
            version: API_VERSION.to_string(),
            healthz: healthz.to_string(),
            key_id: self.key_id.clone(),
        }))
    }

    async fn encrypt(
        &self,
        request: Request<EncryptRequest>,
    ) -> Result<Response<EncryptResponse>, Status> {
        let request = request.into_inner();
        let ciphertext = self
            .encrypt(&request.plaintext)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(EncryptResponse {
            ciphertext,
            key_id: self.key_id.clone(),
            annotations: HashMap::new(),
        }))
    }

    async fn decrypt(
        &self,
        request: Request<DecryptRequest>,
    ) -> Result<Response<DecryptResponse>, Status> {
        let request = request.into_inner();
        let plaintext = self
            .decrypt(&request.ciphertext)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(DecryptResponse { plaintext }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KmsError;
    use crate::health::{DEFAULT_ERR_BUF_SIZE, DEFAULT_HEALTH_CHECK_PERIOD};
    use crate::kms::MockKmsClient;
    use crate::metrics::{KMS_OPERATIONS, STATUS_FAILURE_THROTTLE};

    const KEY: &str = "fakekey";
    const PLAIN_MESSAGE: &[u8] = b"hello world";
    const ENCRYPTED_MESSAGE: &[u8] = b"aGVsbG8gd29ybGQ=";

    fn new_plugin(
        mock: Arc<MockKmsClient>,
        encryption_context: HashMap<String, String>,
    ) -> (V2Plugin, Arc<SharedHealthCheck>) {
        let health_check = Arc::new(SharedHealthCheck::new(
            DEFAULT_HEALTH_CHECK_PERIOD,
            DEFAULT_ERR_BUF_SIZE,
        ));
        let plugin = V2Plugin::new(KEY, mock, encryption_context, health_check.clone());
        (plugin, health_check)
    }

    #[tokio::test]
    async fn encrypt_frames_ciphertext() {
        let mock = Arc::new(MockKmsClient::new());
        mock.set_encrypt_resp(ENCRYPTED_MESSAGE, None);
        let (plugin, _) = new_plugin(mock, HashMap::new());

        let ciphertext = plugin.encrypt(PLAIN_MESSAGE).await.unwrap();
        assert_eq!(ciphertext[0], STORAGE_VERSION);
        assert_eq!(&ciphertext[1..], ENCRYPTED_MESSAGE);
    }

    #[tokio::test]
    async fn throttled_encrypt_labels_and_liveness() {
        let mock = Arc::new(MockKmsClient::new());
        mock.set_encrypt_resp("", Some(KmsError::api("RequestLimitExceeded", "test")));
        let (plugin, _) = new_plugin(mock, HashMap::new());

        let labels = &[KEY, STATUS_FAILURE_THROTTLE, OPERATION_ENCRYPT, VERSION_LABEL];
        let count_before = KMS_OPERATIONS.with_label_values(labels).get();

        let err = plugin.encrypt(PLAIN_MESSAGE).await.unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Throttled);
        assert_eq!(
            KMS_OPERATIONS.with_label_values(labels).get(),
            count_before + 1.0
        );

        // Throttling is an availability problem: both probes report it.
        assert!(plugin.health().await.is_err());
        assert!(plugin.live().await.is_err());
    }

    #[tokio::test]
    async fn user_induced_failure_is_demoted_by_live() {
        let mock = Arc::new(MockKmsClient::new());
        mock.set_encrypt_resp(
            "",
            Some(KmsError::api(
                "AccessDeniedException",
                "The ciphertext refers to a customer master key that does not exist, does not exist in this region, or you are not allowed to access",
            )),
        );
        let (plugin, _) = new_plugin(mock, HashMap::new());

        let err = plugin.encrypt(PLAIN_MESSAGE).await.unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::UserInduced);

        assert!(plugin.health().await.is_err());
        assert!(plugin.live().await.is_ok());
    }

    #[tokio::test]
    async fn corrupt_ciphertext_classifies_as_corruption() {
        let mock = Arc::new(MockKmsClient::new());
        mock.set_decrypt_resp(
            "",
            Some(KmsError::api(
                "InvalidCiphertextException",
                "InvalidCipherException:",
            )),
        );
        let (plugin, _) = new_plugin(mock, HashMap::new());

        let mut tagged = vec![STORAGE_VERSION];
        tagged.extend_from_slice(ENCRYPTED_MESSAGE);
        let err = plugin.decrypt(&tagged).await.unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Corruption);
    }

    #[tokio::test]
    async fn decrypt_requires_storage_version_tag() {
        let mock = Arc::new(MockKmsClient::new());
        mock.set_decrypt_resp(PLAIN_MESSAGE, None);
        let (plugin, _) = new_plugin(mock.clone(), HashMap::new());

        // Untagged input fails locally; KMS is never invoked.
        let err = plugin.decrypt(ENCRYPTED_MESSAGE).await.unwrap_err();
        assert_eq!(err, ProviderError::VersionMismatch(b'a'));
        assert_eq!(ErrorKind::of(&err), ErrorKind::Other);
        assert!(mock.decrypt_calls().is_empty());
    }

    #[tokio::test]
    async fn decrypt_rejects_empty_ciphertext_locally() {
        let mock = Arc::new(MockKmsClient::new());
        let (plugin, _) = new_plugin(mock.clone(), HashMap::new());

        let err = plugin.decrypt(b"").await.unwrap_err();
        assert_eq!(err, ProviderError::EmptyCiphertext);
        assert!(mock.decrypt_calls().is_empty());
    }

    #[tokio::test]
    async fn decrypt_strips_tag_before_kms() {
        let mock = Arc::new(MockKmsClient::new());
        mock.set_decrypt_resp(PLAIN_MESSAGE, None);
        let ctx: HashMap<String, String> = [("a".to_string(), "b".to_string())].into();
        let (plugin, _) = new_plugin(mock.clone(), ctx.clone());

        let mut tagged = vec![STORAGE_VERSION];
        tagged.extend_from_slice(ENCRYPTED_MESSAGE);
        let plain = plugin.decrypt(&tagged).await.unwrap();

        assert_eq!(plain, PLAIN_MESSAGE);
        let calls = mock.decrypt_calls();
        assert_eq!(calls[0].ciphertext, ENCRYPTED_MESSAGE);
        assert_eq!(calls[0].encryption_context.as_ref(), Some(&ctx));
    }

    #[tokio::test]
    async fn status_reports_health_and_key() {
        let mock = Arc::new(MockKmsClient::new());
        mock.set_encrypt_resp(b"cipher".as_slice(), None);
        let (plugin, _) = new_plugin(mock, HashMap::new());

        let response = KeyManagementService::status(&plugin, Request::new(StatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.version, API_VERSION);
        assert_eq!(response.healthz, "ok");
        assert_eq!(response.key_id, KEY);
    }

    #[tokio::test]
    async fn status_reports_err_when_unhealthy() {
        let mock = Arc::new(MockKmsClient::new());
        mock.set_encrypt_resp("", Some(KmsError::Request("fail".into())));
        let (plugin, _) = new_plugin(mock, HashMap::new());

        let response = KeyManagementService::status(&plugin, Request::new(StatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.healthz, "err");
    }

    #[tokio::test]
    async fn rpc_encrypt_returns_key_id() {
        let mock = Arc::new(MockKmsClient::new());
        mock.set_encrypt_resp(ENCRYPTED_MESSAGE, None);
        let (plugin, _) = new_plugin(mock, HashMap::new());

        let response = KeyManagementService::encrypt(
            &plugin,
            Request::new(EncryptRequest {
                plaintext: PLAIN_MESSAGE.to_vec(),
                uid: "uid-1".to_string(),
            }),
        )
        .await
        .unwrap()
        .into_inner();
        assert_eq!(response.key_id, KEY);
        assert_eq!(response.ciphertext[0], STORAGE_VERSION);
        assert!(response.annotations.is_empty());
    }

    #[tokio::test]
    async fn rpc_decrypt_rejects_version_mismatch() {
        let mock = Arc::new(MockKmsClient::new());
        mock.set_decrypt_resp(PLAIN_MESSAGE, None);
        let (plugin, _) = new_plugin(mock.clone(), HashMap::new());

        let status = KeyManagementService::decrypt(
            &plugin,
            Request::new(DecryptRequest {
                ciphertext: ENCRYPTED_MESSAGE.to_vec(),
                uid: "uid-1".to_string(),
                key_id: KEY.to_string(),
                annotations: HashMap::new(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("version"));
        assert!(mock.decrypt_calls().is_empty());
    }
}
