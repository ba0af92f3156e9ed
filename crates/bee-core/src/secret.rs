// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credential store.
//!
//! Passwords are stored per host and namespace under
//! `_bee/passwd/<namespace>/<name>`, encrypted with a [`KeyProvider`] before
//! they reach the database. The default provider uses an RSA key pair shipped
//! with the binary, which makes this obfuscation rather than confidentiality.
//!
//! Values are returned as [`Secret`]s and decrypted only on
//! [`Secret::reveal`].

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Key pair shipped with the binary.
const EMBEDDED_KEY: &str = include_str!("../keys/bee.pem");

// ============================================================================
// Key providers
// ============================================================================

/// Encrypts secrets before they are persisted.
pub trait KeyProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// RSA PKCS#1 v1.5 key provider.
pub struct RsaKeyProvider {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyProvider {
    /// Provider backed by the embedded key pair.
    pub fn embedded() -> Result<Self> {
        Self::from_pem(EMBEDDED_KEY)
    }

    /// Provider from a PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private =
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| Error::Crypto(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }
}

impl KeyProvider for RsaKeyProvider {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        self.public
            .encrypt(&mut rng, Pkcs1v15Encrypt, plaintext)
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| Error::Crypto(e.to_string()))
    }
}

// ============================================================================
// Secret
// ============================================================================

/// An encrypted value, decrypted on demand.
#[derive(Clone)]
pub struct Secret {
    ciphertext: Vec<u8>,
    keys: Arc<dyn KeyProvider>,
}

impl Secret {
    /// Decrypt the value.
    pub fn reveal(&self) -> Result<String> {
        let plaintext = self.keys.decrypt(&self.ciphertext)?;
        String::from_utf8(plaintext).map_err(|e| Error::Crypto(e.to_string()))
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

// ============================================================================
// Store
// ============================================================================

/// Namespaced secret storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret; [`Error::NotExists`] when absent.
    async fn get(&self, name: &str, namespace: &str) -> Result<Secret>;

    /// Encrypt and store a secret, replacing any previous value.
    async fn set(&self, name: &str, namespace: &str, secret: &str) -> Result<()>;
}

/// Storage key of a secret.
pub fn secret_key(name: &str, namespace: &str) -> String {
    format!("_bee/passwd/{}/{}", namespace, name)
}

/// SQLite-backed secret store.
pub struct SqliteSecretStore {
    pool: SqlitePool,
    keys: Arc<dyn KeyProvider>,
    // One writer at a time.
    write: Mutex<()>,
}

impl SqliteSecretStore {
    /// Open (or create) the store at `path`.
    ///
    /// Parent directories are created as needed and writes are synchronous.
    pub async fn from_path(path: impl AsRef<Path>, keys: Arc<dyn KeyProvider>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&url)?.synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| Error::Database(e.into()))?;

        debug!(path = %path.display(), "secret store opened");
        Ok(Self {
            pool,
            keys,
            write: Mutex::new(()),
        })
    }

    /// Flush and close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SecretStore for SqliteSecretStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<Secret> {
        let key = secret_key(name, namespace);
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((ciphertext,)) => Ok(Secret {
                ciphertext,
                keys: self.keys.clone(),
            }),
            None => Err(Error::NotExists(key)),
        }
    }

    async fn set(&self, name: &str, namespace: &str, secret: &str) -> Result<()> {
        let ciphertext = self.keys.encrypt(secret.as_bytes())?;
        let key = secret_key(name, namespace);

        let _guard = self.write.lock().await;
        sqlx::query(
            r#"
            INSERT INTO kv (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&key)
        .bind(ciphertext)
        .execute(&self.pool)
        .await?;

        debug!(key = %key, "secret stored");
        Ok(())
    }
}
