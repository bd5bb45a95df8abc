//! Error types and the KMS error classifier.
//!
//! Every failure that crosses the data plane is classified into one of the
//! [`ErrorKind`] values. The kind drives both the metric status label and the
//! liveness policy: operator-caused failures (disabled key, revoked grant)
//! must not look like an unhealthy sidecar.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Error returned by a KMS backend.
///
/// The structured [`KmsError::Api`] shape mirrors the service error contract:
/// a code string plus a message string. Everything else (connection failures,
/// malformed responses) is carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KmsError {
    /// Structured service error exposing a code and a message.
    #[error("{code}: {message}")]
    Api {
        /// Service error code, e.g. `DisabledException`.
        code: String,
        /// Human-readable message attached by the service.
        message: String,
    },

    /// Transport-level failure or a response the client could not use.
    #[error("{0}")]
    Request(String),
}

impl KmsError {
    /// Constructs a structured service error.
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        KmsError::Api {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Error surfaced by the encryption-provider plugins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// KMS encrypt call failed; the original cause is preserved.
    #[error("failed to encrypt: {0}")]
    Encrypt(#[source] KmsError),

    /// KMS decrypt call failed; the original cause is preserved.
    #[error("failed to decrypt: {0}")]
    Decrypt(#[source] KmsError),

    /// Decrypt was asked to operate on an empty ciphertext.
    #[error("empty ciphertext")]
    EmptyCiphertext,

    /// v2 decrypt input did not start with the storage-version tag.
    #[error("unsupported ciphertext version tag {0:#04x}")]
    VersionMismatch(u8),

    /// The detached health-probe task failed to complete.
    #[error("health probe failed: {0}")]
    Probe(String),
}

/// Classification of a KMS failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No error.
    None,
    /// Operator-caused: key disabled, wrong state, invalid grant.
    UserInduced,
    /// The request was throttled by the service.
    Throttled,
    /// The ciphertext itself is invalid.
    Corruption,
    /// Anything else, including opaque failures.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::None => "",
            ErrorKind::UserInduced => "user-induced",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Error codes the AWS SDK retry machinery treats as throttling.
const THROTTLE_ERROR_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottledException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "TransactionInProgressException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "LimitExceededException",
    "RequestThrottled",
    "SlowDown",
    "PriorRequestNotComplete",
    "EC2ThrottledException",
];

/// The message KMS returns when an external key store proxy times out. Treated
/// as user-induced: only the key-store operator can resolve it.
const XKS_PROXY_TIMEOUT_MESSAGE: &str = "AWS KMS rejected the request because the external key store proxy did not respond in time. Retry the request. If you see this error repeatedly, report it to your external key store proxy administrator";

fn is_throttle_code(code: &str) -> bool {
    THROTTLE_ERROR_CODES.contains(&code)
}

impl ErrorKind {
    /// Classifies a single error.
    ///
    /// The error is unwrapped exactly once via [`StdError::source`], so both
    /// a raw [`KmsError`] and a [`ProviderError`] wrapping one classify
    /// identically. Anything without the structured code+message shape is
    /// [`ErrorKind::Other`].
    pub fn of(err: &(dyn StdError + 'static)) -> ErrorKind {
        let cause = err.source().unwrap_or(err);
        let Some(KmsError::Api { code, message }) = cause.downcast_ref::<KmsError>() else {
            return ErrorKind::Other;
        };

        if is_throttle_code(code) {
            return ErrorKind::Throttled;
        }

        match code.as_str() {
            // CMK is disabled or pending deletion
            "DisabledException" | "KMSInvalidStateException" => ErrorKind::UserInduced,

            // CMK does not exist, or grant is not valid
            "KeyUnavailableException"
            | "InvalidArnException"
            | "InvalidGrantIdException"
            | "InvalidGrantTokenException" => ErrorKind::UserInduced,

            "LimitExceededException" => ErrorKind::Throttled,

            "InvalidCiphertextException" => ErrorKind::Corruption,

            // "AccessDeniedException" covers both a CMK that does not exist
            // (not pending delete) and an IAM role that is not allowed to
            // access it. Only the first is user-induced, and the service does
            // not give it a dedicated code, so match on the message.
            "AccessDeniedException"
                if message.contains("customer master key that does not exist")
                    || message.contains("does not exist in this region") =>
            {
                ErrorKind::UserInduced
            }

            "KMSInternalException" if message.contains(XKS_PROXY_TIMEOUT_MESSAGE) => {
                ErrorKind::UserInduced
            }

            _ => ErrorKind::Other,
        }
    }
}

/// Classifies an optional error; `None` maps to [`ErrorKind::None`].
pub fn classify(err: Option<&(dyn StdError + 'static)>) -> ErrorKind {
    match err {
        None => ErrorKind::None,
        Some(err) => ErrorKind::of(err),
    }
}
