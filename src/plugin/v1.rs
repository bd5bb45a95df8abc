//! v1beta1 encryption-provider plugin.
//!
//! Lenient on decrypt input: ciphertexts written before the storage-version
//! tag existed are forwarded to KMS unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};
use tracing::{debug, error, warn};

use crate::error::{ErrorKind, ProviderError};
use crate::health::SharedHealthCheck;
use crate::kms::KmsClient;
use crate::metrics::{self, OPERATION_DECRYPT, OPERATION_ENCRYPT};
use crate::proto::v1beta1::key_management_service_server::KeyManagementService;
use crate::proto::v1beta1::{
    DecryptRequest, DecryptResponse, EncryptRequest, EncryptResponse, VersionRequest,
    VersionResponse,
};

use super::{HEALTH_PROBE_PLAINTEXT, RUNTIME_NAME, RUNTIME_VERSION, STORAGE_VERSION};

/// API version string reported by the `Version` RPC.
pub const API_VERSION: &str = "v1beta1";

const VERSION_LABEL: &str = "v1";

/// v1beta1 plugin instance. Cheap to clone; all mutable state lives in the
/// shared health check.
#[derive(Clone)]
pub struct V1Plugin {
    kms: Arc<dyn KmsClient>,
    key_id: String,
    encryption_context: HashMap<String, String>,
    health_check: Arc<SharedHealthCheck>,
}

impl V1Plugin {
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
                let mut cipher = Vec::with_capacity(blob.len() + 1);
                cipher.push(STORAGE_VERSION);
                cipher.extend_from_slice(&blob);
                Ok(cipher)
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

    /// Decrypts `cipher`, stripping the storage-version tag when present and
    /// otherwise passing the input through unchanged.
    pub async fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, ProviderError> {
        debug!("starting decrypt operation");
        let started = Instant::now();

        let Some((&first, rest)) = cipher.split_first() else {
            let err = ProviderError::EmptyCiphertext;
            metrics::record_operation(&self.key_id, OPERATION_DECRYPT, VERSION_LABEL, Some(&err), started);
            return Err(err);
        };
        let stripped = if first == STORAGE_VERSION { rest } else { cipher };

        match self.kms.decrypt(stripped, self.context()).await {
            Ok(plain) => {
                debug!("decrypt operation successful");
                metrics::record_operation(&self.key_id, OPERATION_DECRYPT, VERSION_LABEL, None, started);
                Ok(plain)
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

    /// Reports the most recent available KMS liveness signal.
    ///
    /// Uses the cached result when a check happened within the staleness
    /// period; otherwise issues a sentinel encrypt on a detached task (so a
    /// cancelled caller does not abort the probe) and records its outcome.
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

    /// Liveness probe: user-induced failures (disabled key, revoked grant)
    /// are not grounds for a restart and report healthy.
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
impl KeyManagementService for V1Plugin {
    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        Ok(Response::new(VersionResponse {
            version: API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: RUNTIME_VERSION.to_string(),
        }))
    }

    async fn encrypt(
        &self,
        request: Request<EncryptRequest>,
    ) -> Result<Response<EncryptResponse>, Status> {
        let request = request.into_inner();
        let cipher = self
            .encrypt(&request.plain)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(EncryptResponse { cipher }))
    }

    async fn decrypt(
        &self,
        request: Request<DecryptRequest>,
    ) -> Result<Response<DecryptResponse>, Status> {
        let request = request.into_inner();
        let plain = self
            .decrypt(&request.cipher)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(DecryptResponse { plain }))
    }
}
