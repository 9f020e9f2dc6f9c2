//! The credential store: accounts, password verification, login tokens.
//!
//! Accounts live in a JSON file rewritten atomically (temp file plus
//! rename) after every change. Login tokens are stored only as SHA-256
//! digests, so a leaked password file does not leak live sessions.
//!
//! A token is bound to the account's credential version. Changing the
//! password bumps the version and every older token stops working.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tilehost_config::{AuthSettings, CryptAlgorithm, Username, UsernamePolicy};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::hash::{strategy_for, HashStrategy};
use crate::registry::hex;
use crate::SessionError;

/// Verified against when the user does not exist, so unknown names cost
/// as much time as wrong passwords.
const DUMMY_PASSWORD: &str = "tilehost-dummy-password";

// ---------------------------------------------------------------------------
// On-disk format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    hash: String,
    algorithm: CryptAlgorithm,
    #[serde(default)]
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    username: String,
    version: u64,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PasswordDb {
    #[serde(default)]
    users: BTreeMap<String, UserRecord>,
    /// Keyed by hex SHA-256 of the token.
    #[serde(default)]
    tokens: BTreeMap<String, TokenRecord>,
}

/// A freshly issued login token. The plaintext exists only here and in
/// the client's cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginToken {
    pub token: String,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

/// Accounts and login tokens, backed by the password database.
pub struct CredentialStore {
    path: PathBuf,
    policy: UsernamePolicy,
    max_password_len: usize,
    token_lifetime: chrono::Duration,
    strategy: Arc<dyn HashStrategy>,
    salt_length: usize,
    dummy_hash: Arc<str>,
    db: Mutex<PasswordDb>,
}

impl CredentialStore {
    /// Loads the password database, or starts an empty one if the file
    /// does not exist yet.
    ///
    /// # Errors
    /// [`SessionError::Storage`] if the file exists but cannot be read or
    /// parsed.
    pub async fn open(
        settings: &AuthSettings,
        policy: UsernamePolicy,
        token_lifetime: Duration,
    ) -> Result<Self, SessionError> {
        let path = settings.password_db.clone();
        let db = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| storage(&path, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "password database not found; starting empty");
                PasswordDb::default()
            }
            Err(e) => return Err(storage(&path, e)),
        };

        let strategy: Arc<dyn HashStrategy> =
            Arc::from(strategy_for(settings.crypt_algorithm, settings.crypt_salt_length));
        let dummy_hash = {
            let strategy = Arc::clone(&strategy);
            tokio::task::spawn_blocking(move || strategy.hash(DUMMY_PASSWORD))
                .await
                .map_err(|e| SessionError::Hashing(e.to_string()))??
        };

        info!(
            path = %path.display(),
            users = db.users.len(),
            algorithm = settings.crypt_algorithm.tag(),
            "credential store opened"
        );

        Ok(Self {
            path,
            policy,
            max_password_len: settings.max_passwd_length,
            token_lifetime: chrono::Duration::from_std(token_lifetime)
                .unwrap_or(chrono::Duration::MAX),
            strategy,
            salt_length: settings.crypt_salt_length,
            dummy_hash: Arc::from(dummy_hash),
            db: Mutex::new(db),
        })
    }

    pub fn policy(&self) -> &UsernamePolicy {
        &self.policy
    }

    pub async fn user_count(&self) -> usize {
        self.db.lock().await.users.len()
    }

    /// Checks a password. Unknown users, over-long passwords, and wrong
    /// passwords are indistinguishable to the caller.
    pub async fn verify(&self, username: &str, password: &str) -> bool {
        let record = self.db.lock().await.users.get(username).cloned();
        let too_long = password.chars().count() > self.max_password_len;

        let (strategy, stored, real) = match record {
            Some(r) if !too_long => (strategy_for(r.algorithm, self.salt_length), r.hash, true),
            _ => (
                strategy_for(self.strategy.algorithm(), self.salt_length),
                self.dummy_hash.to_string(),
                false,
            ),
        };
        let password = password.to_string();
        let ok = tokio::task::spawn_blocking(move || strategy.verify(&password, &stored))
            .await
            .unwrap_or(false);
        ok && real
    }

    /// Creates an account.
    ///
    /// # Errors
    /// [`SessionError::InvalidUsername`], [`SessionError::InvalidPassword`],
    /// [`SessionError::UserExists`], or a storage error.
    pub async fn register(&self, username: &str, password: &str) -> Result<Username, SessionError> {
        let username = self.policy.parse(username)?;
        self.check_password(password)?;
        let hash = self.hash(password).await?;

        let mut db = self.db.lock().await;
        if db.users.contains_key(username.as_str()) {
            return Err(SessionError::UserExists(username.into_inner()));
        }
        let now = Utc::now();
        db.users.insert(
            username.as_str().to_string(),
            UserRecord {
                hash,
                algorithm: self.strategy.algorithm(),
                version: 0,
                created_at: now,
                updated_at: now,
            },
        );
        self.save(&mut db).await?;
        info!(%username, "account registered");
        Ok(username)
    }

    /// Replaces a password after checking the current one. Revokes every
    /// login token the user holds.
    ///
    /// # Errors
    /// [`SessionError::AuthFailed`] if `current` is wrong.
    pub async fn change_password(
        &self,
        username: &str,
        current: &str,
        new: &str,
    ) -> Result<(), SessionError> {
        if !self.verify(username, current).await {
            return Err(SessionError::AuthFailed);
        }
        self.check_password(new)?;
        let hash = self.hash(new).await?;

        let mut db = self.db.lock().await;
        let record = db.users.get_mut(username).ok_or(SessionError::AuthFailed)?;
        record.hash = hash;
        record.algorithm = self.strategy.algorithm();
        record.version += 1;
        record.updated_at = Utc::now();
        db.tokens.retain(|_, t| t.username != username);
        self.save(&mut db).await?;
        info!(%username, "password changed; login tokens revoked");
        Ok(())
    }

    /// Issues a login token valid for the configured lifetime.
    ///
    /// # Errors
    /// [`SessionError::AuthFailed`] for an unknown user.
    pub async fn issue_token(&self, username: &str) -> Result<LoginToken, SessionError> {
        let mut db = self.db.lock().await;
        let token = Self::insert_token(&mut db, username, Utc::now(), self.token_lifetime)?;
        self.save(&mut db).await?;
        Ok(token)
    }

    /// Returns the token's owner if it is valid now.
    pub async fn validate_token(&self, token: &str) -> Result<String, SessionError> {
        self.validate_token_at(token, Utc::now()).await
    }

    /// Returns the token's owner if it is valid at `now`.
    ///
    /// # Errors
    /// [`SessionError::ExpiredToken`] at or after the expiry;
    /// [`SessionError::InvalidToken`] if unknown or revoked.
    pub async fn validate_token_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<String, SessionError> {
        let db = self.db.lock().await;
        Self::check_token(&db, &digest(token), now).map(|t| t.username.clone())
    }

    /// Consumes a token and issues its replacement. A token can only be
    /// redeemed once.
    pub async fn redeem_token(&self, token: &str) -> Result<LoginToken, SessionError> {
        let now = Utc::now();
        let key = digest(token);
        let mut db = self.db.lock().await;
        let username = Self::check_token(&db, &key, now)?.username.clone();
        db.tokens.remove(&key);
        let fresh = Self::insert_token(&mut db, &username, now, self.token_lifetime)?;
        self.save(&mut db).await?;
        debug!(%username, "login token rotated");
        Ok(fresh)
    }

    /// Revokes a token. Unknown tokens are ignored.
    pub async fn forget_token(&self, token: &str) -> Result<(), SessionError> {
        let mut db = self.db.lock().await;
        if db.tokens.remove(&digest(token)).is_some() {
            self.save(&mut db).await?;
        }
        Ok(())
    }

    /// Writes the database out. Called on shutdown; every mutation
    /// already saves.
    pub async fn flush(&self) -> Result<(), SessionError> {
        let mut db = self.db.lock().await;
        self.save(&mut db).await
    }

    // -----------------------------------------------------------------------

    fn check_password(&self, password: &str) -> Result<(), SessionError> {
        let len = password.chars().count();
        if len == 0 || len > self.max_password_len {
            return Err(SessionError::InvalidPassword {
                max: self.max_password_len,
            });
        }
        Ok(())
    }

    async fn hash(&self, password: &str) -> Result<String, SessionError> {
        let strategy = Arc::clone(&self.strategy);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || strategy.hash(&password))
            .await
            .map_err(|e| SessionError::Hashing(e.to_string()))?
    }

    fn check_token<'a>(
        db: &'a PasswordDb,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<&'a TokenRecord, SessionError> {
        let record = db.tokens.get(key).ok_or(SessionError::InvalidToken)?;
        if now >= record.expires_at {
            return Err(SessionError::ExpiredToken);
        }
        match db.users.get(&record.username) {
            Some(user) if user.version == record.version => Ok(record),
            _ => Err(SessionError::InvalidToken),
        }
    }

    fn insert_token(
        db: &mut PasswordDb,
        username: &str,
        now: DateTime<Utc>,
        lifetime: chrono::Duration,
    ) -> Result<LoginToken, SessionError> {
        let version = db
            .users
            .get(username)
            .map(|u| u.version)
            .ok_or(SessionError::AuthFailed)?;
        let token = generate_token();
        let expires_at = now.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC);
        db.tokens.insert(
            digest(&token),
            TokenRecord {
                username: username.to_string(),
                version,
                issued_at: now,
                expires_at,
            },
        );
        Ok(LoginToken {
            token,
            username: username.to_string(),
            expires_at,
        })
    }

    /// Drops expired tokens, then rewrites the file atomically.
    async fn save(&self, db: &mut PasswordDb) -> Result<(), SessionError> {
        let now = Utc::now();
        let before = db.tokens.len();
        db.tokens.retain(|_, t| t.expires_at > now);
        if db.tokens.len() != before {
            debug!(purged = before - db.tokens.len(), "expired login tokens purged");
        }

        let bytes = serde_json::to_vec_pretty(&*db).map_err(|e| storage(&self.path, e))?;
        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| storage(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(path = %self.path.display(), error = %e, "password database not saved");
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(storage(&self.path, e));
        }
        Ok(())
    }
}

fn storage(path: &Path, e: impl std::fmt::Display) -> SessionError {
    SessionError::Storage {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn digest(token: &str) -> String {
    hex(&Sha256::digest(token.as_bytes()))
}

/// 256 random bits as hex.
fn generate_token() -> String {
    use rand::Rng;
    let bytes: [u8; 32] = rand::rng().random();
    hex(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn settings(dir: &Path, algorithm: CryptAlgorithm) -> AuthSettings {
        AuthSettings {
            password_db: dir.join("passwd.json"),
            crypt_algorithm: algorithm,
            crypt_salt_length: 16,
            ..AuthSettings::default()
        }
    }

    async fn store(dir: &Path) -> CredentialStore {
        CredentialStore::open(&settings(dir, CryptAlgorithm::Sha512), UsernamePolicy::default(), WEEK)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.register("Alice", "hunter2").await.unwrap();

        assert!(store.verify("Alice", "hunter2").await);
        assert!(!store.verify("Alice", "hunter3").await);
        assert!(!store.verify("Nobody", "hunter2").await);
    }

    #[tokio::test]
    async fn test_register_duplicate_is_user_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.register("Alice", "hunter2").await.unwrap();
        let err = store.register("Alice", "other").await.unwrap_err();
        assert!(matches!(err, SessionError::UserExists(name) if name == "Alice"));
    }

    #[tokio::test]
    async fn test_register_rejects_bad_name_and_long_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        assert!(matches!(
            store.register("../etc", "pw").await,
            Err(SessionError::InvalidUsername(_))
        ));
        assert!(matches!(
            store.register("Alice", &"x".repeat(21)).await,
            Err(SessionError::InvalidPassword { max: 20 })
        ));
        assert!(matches!(
            store.register("Alice", "").await,
            Err(SessionError::InvalidPassword { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_overlong_password_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let pw = "a".repeat(20);
        store.register("Alice", &pw).await.unwrap();
        assert!(store.verify("Alice", &pw).await);
        assert!(!store.verify("Alice", &format!("{pw}a")).await);
    }

    #[tokio::test]
    async fn test_open_reloads_saved_accounts() {
        let dir = tempfile::tempdir().unwrap();
        store(dir.path()).await.register("Alice", "hunter2").await.unwrap();

        let reopened = store(dir.path()).await;
        assert_eq!(reopened.user_count().await, 1);
        assert!(reopened.verify("Alice", "hunter2").await);
        assert!(!dir.path().join("passwd.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_verify_uses_record_algorithm_after_config_change() {
        let dir = tempfile::tempdir().unwrap();
        store(dir.path()).await.register("Alice", "hunter2").await.unwrap();

        let argon = CredentialStore::open(
            &settings(dir.path(), CryptAlgorithm::Argon2),
            UsernamePolicy::default(),
            WEEK,
        )
        .await
        .unwrap();
        assert!(argon.verify("Alice", "hunter2").await);
    }

    #[tokio::test]
    async fn test_validate_token_at_expiry_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.register("Alice", "hunter2").await.unwrap();
        let issued = store.issue_token("Alice").await.unwrap();

        let eps = chrono::Duration::seconds(1);
        assert_eq!(
            store.validate_token_at(&issued.token, issued.expires_at - eps).await.unwrap(),
            "Alice"
        );
        assert!(matches!(
            store.validate_token_at(&issued.token, issued.expires_at + eps).await,
            Err(SessionError::ExpiredToken)
        ));
    }

    #[tokio::test]
    async fn test_redeem_token_rotates_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.register("Alice", "hunter2").await.unwrap();
        let first = store.issue_token("Alice").await.unwrap();

        let second = store.redeem_token(&first.token).await.unwrap();
        assert_ne!(first.token, second.token);
        assert_eq!(second.username, "Alice");
        assert!(matches!(
            store.redeem_token(&first.token).await,
            Err(SessionError::InvalidToken)
        ));
        assert!(store.validate_token(&second.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_change_password_revokes_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.register("Alice", "hunter2").await.unwrap();
        let token = store.issue_token("Alice").await.unwrap();

        assert!(matches!(
            store.change_password("Alice", "wrong", "new-pw").await,
            Err(SessionError::AuthFailed)
        ));
        store.change_password("Alice", "hunter2", "new-pw").await.unwrap();

        assert!(store.verify("Alice", "new-pw").await);
        assert!(!store.verify("Alice", "hunter2").await);
        assert!(matches!(
            store.validate_token(&token.token).await,
            Err(SessionError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_forget_token_and_plaintext_never_saved() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.register("Alice", "hunter2").await.unwrap();
        let token = store.issue_token("Alice").await.unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join("passwd.json")).unwrap();
        assert!(!on_disk.contains(&token.token));
        assert!(on_disk.contains(&digest(&token.token)));

        store.forget_token(&token.token).await.unwrap();
        store.forget_token(&token.token).await.unwrap();
        assert!(matches!(
            store.validate_token(&token.token).await,
            Err(SessionError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_open_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("passwd.json"), "{ not json").unwrap();
        let result = CredentialStore::open(
            &settings(dir.path(), CryptAlgorithm::Sha512),
            UsernamePolicy::default(),
            WEEK,
        )
        .await;
        assert!(matches!(result, Err(SessionError::Storage { .. })));
    }
}
