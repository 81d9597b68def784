use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("no password known for key '{0}'")]
    MissingPassword(String),

    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("crypto backend failure: {0}")]
    Backend(String),
}

/// Source of crypto contexts. The manager never looks at key material.
pub trait CryptoProvider: Send + Sync {
    fn create_context(&self, cipher: &str, password: &str) -> Result<Box<dyn CryptoContext>, CryptoError>;
}

/// Seals and opens settings payloads for one key.
pub trait CryptoContext: Send + Sync {
    fn cipher(&self) -> &str;

    /// Identifier stored next to the sealed payload so the right password can
    /// be asked for on load.
    fn key_id(&self) -> &str;

    fn save(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn load(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Passwords supplied by the user, keyed by key ID, plus the provider that
/// turns them into contexts.
pub struct Keyring {
    provider: Arc<dyn CryptoProvider>,
    passwords: RwLock<HashMap<String, String>>,
}

impl Keyring {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            provider,
            passwords: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_password(&self, key_id: &str, password: &str) {
        self.passwords
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key_id.to_string(), password.to_string());
    }

    /// Context for a payload sealed with `cipher` under `key_id`.
    pub fn context_for(&self, cipher: &str, key_id: &str) -> Result<Box<dyn CryptoContext>, CryptoError> {
        let password = self
            .passwords
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key_id)
            .cloned()
            .ok_or_else(|| CryptoError::MissingPassword(key_id.to_string()))?;
        self.provider.create_context(cipher, &password)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Reversible keyed transform standing in for a real cipher.
    pub struct XorProvider;

    pub struct XorContext {
        key: Vec<u8>,
        key_id: String,
    }

    const MAGIC: &[u8] = b"VMKX";

    pub const TEST_KEY_ID: &str = "test-key";

    impl CryptoProvider for XorProvider {
        fn create_context(&self, cipher: &str, password: &str) -> Result<Box<dyn CryptoContext>, CryptoError> {
            if cipher != "xor" {
                return Err(CryptoError::UnsupportedCipher(cipher.to_string()));
            }
            if password.is_empty() {
                return Err(CryptoError::Backend("empty password".into()));
            }
            Ok(Box::new(XorContext {
                key: password.as_bytes().to_vec(),
                key_id: TEST_KEY_ID.into(),
            }))
        }
    }

    impl XorContext {
        fn apply(&self, data: &[u8]) -> Vec<u8> {
            data.iter()
                .zip(self.key.iter().cycle())
                .map(|(b, k)| b ^ k)
                .collect()
        }
    }

    impl CryptoContext for XorContext {
        fn cipher(&self) -> &str {
            "xor"
        }

        fn key_id(&self) -> &str {
            &self.key_id
        }

        fn save(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            let mut data = MAGIC.to_vec();
            data.extend_from_slice(plaintext);
            Ok(self.apply(&data))
        }

        fn load(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
            let data = self.apply(sealed);
            match data.strip_prefix(MAGIC) {
                Some(rest) => Ok(rest.to_vec()),
                None => Err(CryptoError::Backend("the password is incorrect".into())),
            }
        }
    }

    #[test]
    fn xor_context_detects_wrong_password() {
        let good = XorProvider.create_context("xor", "secret").unwrap();
        let bad = XorProvider.create_context("xor", "guess").unwrap();
        let sealed = good.save(b"{\"a\":1}").unwrap();
        assert_eq!(good.load(&sealed).unwrap(), b"{\"a\":1}");
        assert!(matches!(bad.load(&sealed).unwrap_err(), CryptoError::Backend(_)));
        assert!(XorProvider.create_context("aes", "secret").is_err());
    }

    #[test]
    fn keyring_resolves_known_keys_only() {
        let keyring = Keyring::new(Arc::new(XorProvider));
        assert_eq!(
            keyring.context_for("xor", TEST_KEY_ID).err(),
            Some(CryptoError::MissingPassword(TEST_KEY_ID.into()))
        );
        keyring.add_password(TEST_KEY_ID, "secret");
        assert!(keyring.context_for("xor", TEST_KEY_ID).is_ok());
        assert!(keyring.context_for("aes", TEST_KEY_ID).is_err());
    }
}
