//! OS keychain storage for the API key

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const ACCOUNT: &str = "api_key";

#[derive(Error, Debug)]
pub enum KeychainError {
    #[error("No API key in the keychain")]
    NotFound,
    #[error("Keychain error: {0}")]
    Platform(String),
}

impl From<keyring::Error> for KeychainError {
    fn from(e: keyring::Error) -> Self {
        match e {
            keyring::Error::NoEntry => KeychainError::NotFound,
            other => KeychainError::Platform(other.to_string()),
        }
    }
}

pub struct Keychain {
    service: String,
}

impl Keychain {
    pub fn new(service: &str) -> Self {
        Self { service: service.to_string() }
    }

    fn entry(&self) -> Result<keyring::Entry, KeychainError> {
        Ok(keyring::Entry::new(&self.service, ACCOUNT)?)
    }

    pub fn store_api_key(&self, key: &SecretString) -> Result<(), KeychainError> {
        self.entry()?.set_password(key.expose_secret())?;
        Ok(())
    }

    pub fn api_key(&self) -> Result<SecretString, KeychainError> {
        let raw = self.entry()?.get_password()?;
        if raw.trim().is_empty() {
            return Err(KeychainError::NotFound);
        }
        Ok(SecretString::new(raw))
    }

    pub fn delete_api_key(&self) -> Result<(), KeychainError> {
        self.entry()?.delete_password()?;
        Ok(())
    }
}
