//! Argon2id password hashing bound to an application as the `password_hasher` extension.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
};

use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordVerifier, Version,
    password_hash::{self, SaltString},
};
use secrecy::{ExposeSecret, Secret};
use thiserror::Error;

use crate::app::{Application, Extension};
use crate::application::error::AppError;
use crate::config::PasswordSettings;
use crate::infra::telemetry::spawn_blocking_with_tracing;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("invalid argon2 parameters: {0}")]
    Params(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("stored password hash is malformed: {0}")]
    Malformed(String),
    #[error("password task failed: {0}")]
    Task(String),
}

const DUMMY_PASSWORD: &str = "truss-dummy-password";

/// Hashing parameters owned by one application.
///
/// Clones share the dummy hash and the verification counter.
#[derive(Debug, Clone)]
pub struct Passwords {
    params: Params,
    dummy_hash: Arc<OnceLock<String>>,
    verifications: Arc<AtomicU64>,
}

impl Passwords {
    pub fn new(settings: &PasswordSettings) -> Result<Self, PasswordError> {
        let params = Params::new(
            settings.memory_kib.get(),
            settings.iterations.get(),
            settings.parallelism.get(),
            None,
        )
        .map_err(|err| PasswordError::Params(err.to_string()))?;
        Ok(Self {
            params,
            dummy_hash: Arc::new(OnceLock::new()),
            verifications: Arc::new(AtomicU64::new(0)),
        })
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, password: &Secret<String>) -> Result<String, PasswordError> {
        use argon2::PasswordHasher as _;

        let salt = SaltString::generate(&mut rand::thread_rng());
        self.hasher()
            .hash_password(password.expose_secret().as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| PasswordError::Hash(err.to_string()))
    }

    /// Returns `Ok(false)` on mismatch; a malformed stored hash is an error.
    pub fn verify(&self, password: &Secret<String>, stored: &str) -> Result<bool, PasswordError> {
        self.verifications.fetch_add(1, Ordering::Relaxed);
        let parsed =
            PasswordHash::new(stored).map_err(|err| PasswordError::Malformed(err.to_string()))?;
        match self
            .hasher()
            .verify_password(password.expose_secret().as_bytes(), &parsed)
        {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(err) => Err(PasswordError::Hash(err.to_string())),
        }
    }

    /// Number of Argon2 verifications run so far, dummy ones included.
    pub fn verifications(&self) -> u64 {
        self.verifications.load(Ordering::Relaxed)
    }

    /// A hash with this application's parameters for a password no user has.
    pub fn dummy_hash(&self) -> Result<&str, PasswordError> {
        if let Some(hash) = self.dummy_hash.get() {
            return Ok(hash.as_str());
        }
        let hash = self.hash(&Secret::new(DUMMY_PASSWORD.to_string()))?;
        Ok(self.dummy_hash.get_or_init(|| hash).as_str())
    }

    /// Spends one full verification against the dummy hash and always reports a mismatch.
    pub fn verify_dummy(&self, password: &Secret<String>) -> Result<bool, PasswordError> {
        let stored = self.dummy_hash()?.to_string();
        self.verify(password, &stored).map(|_| false)
    }

    pub async fn hash_blocking(&self, password: Secret<String>) -> Result<String, PasswordError> {
        let passwords = self.clone();
        spawn_blocking_with_tracing(move || passwords.hash(&password))
            .await
            .map_err(|err| PasswordError::Task(err.to_string()))?
    }

    pub async fn verify_blocking(
        &self,
        password: Secret<String>,
        stored: String,
    ) -> Result<bool, PasswordError> {
        let passwords = self.clone();
        spawn_blocking_with_tracing(move || passwords.verify(&password, &stored))
            .await
            .map_err(|err| PasswordError::Task(err.to_string()))?
    }

    pub async fn verify_dummy_blocking(
        &self,
        password: Secret<String>,
    ) -> Result<bool, PasswordError> {
        let passwords = self.clone();
        spawn_blocking_with_tracing(move || passwords.verify_dummy(&password))
            .await
            .map_err(|err| PasswordError::Task(err.to_string()))?
    }
}

/// Binds an application's [`Passwords`] built from its `passwords` settings.
#[derive(Debug, Default)]
pub struct PasswordHasher;

impl Extension for PasswordHasher {
    fn name(&self) -> &'static str {
        "password_hasher"
    }

    fn init_app(&self, app: &mut Application) -> Result<(), AppError> {
        let passwords = Passwords::new(&app.settings().passwords)?;
        passwords.dummy_hash()?;
        app.insert_extension(Arc::new(passwords));
        Ok(())
    }
}
