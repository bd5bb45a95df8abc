//! AWS KMS client.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_smithy_runtime_api::box_error::BoxError;
use aws_smithy_runtime_api::client::interceptors::context::BeforeTransmitInterceptorContextMut;
use aws_smithy_runtime_api::client::interceptors::Intercept;
use aws_smithy_runtime_api::client::runtime_components::RuntimeComponents;
use aws_smithy_types::config_bag::ConfigBag;
use thiserror::Error;
use tracing::info;

use super::{KmsClient, KmsError};

const HEADER_SOURCE_ARN: &str = "x-amz-source-arn";
const HEADER_SOURCE_ACCOUNT: &str = "x-amz-source-account";

/// Construction-time settings for the real client.
#[derive(Debug, Clone, Default)]
pub struct AwsKmsConfig {
    /// AWS region; resolved through the default provider chain (including
    /// instance metadata) when unset.
    pub region: Option<String>,
    /// Endpoint URL override; empty means the service default.
    pub endpoint: Option<String>,
    /// Client-side retry token capacity. Non-zero enables adaptive retries.
    pub retry_token_capacity: usize,
    /// Deprecated request-rate limit, kept for compatibility.
    pub qps_limit: usize,
    /// Deprecated burst limit paired with `qps_limit`.
    pub burst_limit: usize,
    /// Caller ARN attached as confused-deputy headers when set.
    pub source_arn: Option<String>,
}

/// Errors raised while building the client.
#[derive(Debug, Error)]
pub enum AwsClientError {
    /// No region configured and none discoverable from the environment.
    #[error("unable to determine AWS region")]
    MissingRegion,

    /// The configured source ARN is not a valid ARN.
    #[error("incorrect ARN format for source arn: {0}")]
    InvalidSourceArn(String),
}

/// KMS client backed by the AWS SDK.
///
/// Retries, rate limiting, and back-off live entirely inside the SDK; callers
/// see only the final outcome of each request.
#[derive(Debug, Clone)]
pub struct AwsKmsClient {
    client: aws_sdk_kms::Client,
}

impl AwsKmsClient {
    /// Builds a client from the default credential chain plus the given
    /// overrides.
    pub async fn new(config: &AwsKmsConfig) -> Result<Self, AwsClientError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }

        if config.retry_token_capacity > 0 {
            loader = loader.retry_config(RetryConfig::adaptive());
        } else if config.qps_limit > 0 {
            info!("qps and burst limits are deprecated, use retry token capacity instead");
            loader = loader.retry_config(RetryConfig::adaptive());
        }

        let shared = loader.load().await;
        if shared.region().is_none() {
            return Err(AwsClientError::MissingRegion);
        }

        let mut builder = aws_sdk_kms::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }
        if let Some(source_arn) = &config.source_arn {
            let source_account = source_account(source_arn)
                .ok_or_else(|| AwsClientError::InvalidSourceArn(source_arn.clone()))?;
            info!(
                source_arn = %source_arn,
                source_account = %source_account,
                "configuring KMS client with confused deputy headers"
            );
            builder = builder.interceptor(ConfusedDeputyHeaders {
                source_arn: source_arn.clone(),
                source_account,
            });
        }

        Ok(Self {
            client: aws_sdk_kms::Client::from_conf(builder.build()),
        })
    }
}

#[async_trait]
impl KmsClient for AwsKmsClient {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        key_id: &str,
        encryption_context: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, KmsError> {
        let mut req = self
            .client
            .encrypt()
            .key_id(key_id)
            .plaintext(Blob::new(plaintext));
        if let Some(ctx) = encryption_context {
            for (k, v) in ctx {
                req = req.encryption_context(k.clone(), v.clone());
            }
        }

        let out = req.send().await.map_err(into_kms_error)?;
        out.ciphertext_blob
            .map(Blob::into_inner)
            .ok_or_else(|| KmsError::Request("response missing ciphertext blob".to_string()))
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        encryption_context: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, KmsError> {
        let mut req = self.client.decrypt().ciphertext_blob(Blob::new(ciphertext));
        if let Some(ctx) = encryption_context {
            for (k, v) in ctx {
                req = req.encryption_context(k.clone(), v.clone());
            }
        }

        let out = req.send().await.map_err(into_kms_error)?;
        out.plaintext
            .map(Blob::into_inner)
            .ok_or_else(|| KmsError::Request("response missing plaintext".to_string()))
    }
}

/// Maps an SDK error onto the provider's error shape, preserving the service
/// code and message when the failure was modeled.
fn into_kms_error<E>(err: SdkError<E>) -> KmsError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match err.code() {
        Some(code) => KmsError::Api {
            code: code.to_string(),
            message: err.message().unwrap_or_default().to_string(),
        },
        None => KmsError::Request(DisplayErrorContext(&err).to_string()),
    }
}

/// Extracts the account id from an ARN.
///
/// ARN format: `arn:partition:service:region:account-id:resource`.
fn source_account(arn: &str) -> Option<String> {
    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    if parts.len() != 6 || parts[0] != "arn" || parts[1].is_empty() || parts[4].is_empty() {
        return None;
    }
    Some(parts[4].to_string())
}

/// Attaches `x-amz-source-arn` and `x-amz-source-account` to every request.
#[derive(Debug)]
struct ConfusedDeputyHeaders {
    source_arn: String,
    source_account: String,
}

impl Intercept for ConfusedDeputyHeaders {
    fn name(&self) -> &'static str {
        "ConfusedDeputyHeaders"
    }

    fn modify_before_signing(
        &self,
        context: &mut BeforeTransmitInterceptorContextMut<'_>,
        _runtime_components: &RuntimeComponents,
        _cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        let headers = context.request_mut().headers_mut();
        headers.insert(HEADER_SOURCE_ACCOUNT, self.source_account.clone());
        headers.insert(HEADER_SOURCE_ARN, self.source_arn.clone());
        Ok(())
    }
}
