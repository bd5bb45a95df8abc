//! In-memory KMS used by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{KmsClient, KmsError};

/// One recorded encrypt invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptCall {
    /// Plaintext the caller supplied.
    pub plaintext: Vec<u8>,
    /// Key the caller encrypted under.
    pub key_id: String,
    /// Encryption context, when supplied.
    pub encryption_context: Option<HashMap<String, String>>,
}

/// One recorded decrypt invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptCall {
    /// Ciphertext blob the caller supplied.
    pub ciphertext: Vec<u8>,
    /// Encryption context, when supplied.
    pub encryption_context: Option<HashMap<String, String>>,
}

type EncryptPredicate = Box<dyn Fn(&EncryptCall) -> bool + Send + Sync>;
type DecryptPredicate = Box<dyn Fn(&DecryptCall) -> bool + Send + Sync>;

struct EncryptRule {
    predicate: EncryptPredicate,
    response: Result<Vec<u8>, KmsError>,
}

struct DecryptRule {
    predicate: DecryptPredicate,
    response: Result<Vec<u8>, KmsError>,
}

struct MockState {
    default_encrypt: Result<Vec<u8>, KmsError>,
    default_decrypt: Result<Vec<u8>, KmsError>,
    encrypt_rules: Vec<EncryptRule>,
    decrypt_rules: Vec<DecryptRule>,
    encrypt_calls: Vec<EncryptCall>,
    decrypt_calls: Vec<DecryptCall>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            default_encrypt: Ok(Vec::new()),
            default_decrypt: Ok(Vec::new()),
            encrypt_rules: Vec::new(),
            decrypt_rules: Vec::new(),
            encrypt_calls: Vec::new(),
            decrypt_calls: Vec::new(),
        }
    }
}

/// Configurable in-memory [`KmsClient`].
///
/// Responses resolve through the conditional rules in insertion order, then
/// fall back to the default response. Every invocation is recorded and can be
/// inspected afterwards.
#[derive(Default)]
pub struct MockKmsClient {
    state: RwLock<MockState>,
}

impl MockKmsClient {
    /// Creates a mock whose default responses are empty successes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default encrypt response.
    pub fn set_encrypt_resp(&self, ciphertext: impl Into<Vec<u8>>, err: Option<KmsError>) {
        self.state.write().default_encrypt = match err {
            Some(err) => Err(err),
            None => Ok(ciphertext.into()),
        };
    }

    /// Sets the default decrypt response.
    pub fn set_decrypt_resp(&self, plaintext: impl Into<Vec<u8>>, err: Option<KmsError>) {
        self.state.write().default_decrypt = match err {
            Some(err) => Err(err),
            None => Ok(plaintext.into()),
        };
    }

    /// Adds a conditional encrypt rule, evaluated before the default.
    pub fn add_encrypt_rule(
        &self,
        predicate: impl Fn(&EncryptCall) -> bool + Send + Sync + 'static,
        ciphertext: impl Into<Vec<u8>>,
        err: Option<KmsError>,
    ) {
        let response = match err {
            Some(err) => Err(err),
            None => Ok(ciphertext.into()),
        };
        self.state.write().encrypt_rules.push(EncryptRule {
            predicate: Box::new(predicate),
            response,
        });
    }

    /// Adds a conditional decrypt rule, evaluated before the default.
    pub fn add_decrypt_rule(
        &self,
        predicate: impl Fn(&DecryptCall) -> bool + Send + Sync + 'static,
        plaintext: impl Into<Vec<u8>>,
        err: Option<KmsError>,
    ) {
        let response = match err {
            Some(err) => Err(err),
            None => Ok(plaintext.into()),
        };
        self.state.write().decrypt_rules.push(DecryptRule {
            predicate: Box::new(predicate),
            response,
        });
    }

    /// Removes all conditional rules.
    pub fn clear_rules(&self) {
        let mut state = self.state.write();
        state.encrypt_rules.clear();
        state.decrypt_rules.clear();
    }

    /// Every encrypt invocation seen so far.
    pub fn encrypt_calls(&self) -> Vec<EncryptCall> {
        self.state.read().encrypt_calls.clone()
    }

    /// Every decrypt invocation seen so far.
    pub fn decrypt_calls(&self) -> Vec<DecryptCall> {
        self.state.read().decrypt_calls.clone()
    }
}

#[async_trait]
impl KmsClient for MockKmsClient {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        key_id: &str,
        encryption_context: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, KmsError> {
        let call = EncryptCall {
            plaintext: plaintext.to_vec(),
            key_id: key_id.to_string(),
            encryption_context: encryption_context.cloned(),
        };

        let mut state = self.state.write();
        state.encrypt_calls.push(call.clone());
        for rule in &state.encrypt_rules {
            if (rule.predicate)(&call) {
                return rule.response.clone();
            }
        }
        state.default_encrypt.clone()
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        encryption_context: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, KmsError> {
        let call = DecryptCall {
            ciphertext: ciphertext.to_vec(),
            encryption_context: encryption_context.cloned(),
        };

        let mut state = self.state.write();
        state.decrypt_calls.push(call.clone());
        for rule in &state.decrypt_rules {
            if (rule.predicate)(&call) {
                return rule.response.clone();
            }
        }
        state.default_decrypt.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_responses() {
        let mock = MockKmsClient::new();
        mock.set_encrypt_resp(b"cipher".as_slice(), None);
        mock.set_decrypt_resp(b"plain".as_slice(), None);

        assert_eq!(mock.encrypt(b"plain", "key", None).await.unwrap(), b"cipher");
        assert_eq!(mock.decrypt(b"cipher", None).await.unwrap(), b"plain");
    }

    #[tokio::test]
    async fn default_error_response() {
        let mock = MockKmsClient::new();
        mock.set_encrypt_resp("", Some(KmsError::Request("fail".into())));

        let err = mock.encrypt(b"plain", "key", None).await.unwrap_err();
        assert_eq!(err, KmsError::Request("fail".into()));
    }

    #[tokio::test]
    async fn rules_take_precedence_in_order() {
        let mock = MockKmsClient::new();
        mock.set_encrypt_resp(b"default".as_slice(), None);
        mock.add_encrypt_rule(|call| call.plaintext == b"foo", b"first".as_slice(), None);
        mock.add_encrypt_rule(|call| call.plaintext == b"foo", b"second".as_slice(), None);

        assert_eq!(mock.encrypt(b"foo", "key", None).await.unwrap(), b"first");
        assert_eq!(mock.encrypt(b"bar", "key", None).await.unwrap(), b"default");

        mock.clear_rules();
        assert_eq!(mock.encrypt(b"foo", "key", None).await.unwrap(), b"default");
    }

    #[tokio::test]
    async fn records_calls() {
        let mock = MockKmsClient::new();
        let ctx: HashMap<String, String> = [("a".to_string(), "b".to_string())].into();

        mock.encrypt(b"one", "key-1", Some(&ctx)).await.unwrap();
        mock.decrypt(b"two", None).await.unwrap();

        let encrypts = mock.encrypt_calls();
        assert_eq!(encrypts.len(), 1);
        assert_eq!(encrypts[0].plaintext, b"one");
        assert_eq!(encrypts[0].key_id, "key-1");
        assert_eq!(encrypts[0].encryption_context.as_ref(), Some(&ctx));

        let decrypts = mock.decrypt_calls();
        assert_eq!(decrypts.len(), 1);
        assert_eq!(decrypts[0].ciphertext, b"two");
        assert!(decrypts[0].encryption_context.is_none());
    }
}
