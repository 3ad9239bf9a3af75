use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use tianyi_core::config::AuthConfig;
use tianyi_core::types::now_timestamp;
use tianyi_store::log::{LogHandle, UserRow};

use crate::error::{Result, UserError};

type HmacSha256 = Hmac<Sha256>;

/// Tokens handed back by login / auto-login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginTokens {
    pub user_id: String,
    pub login_token: String,
    pub message_token: String,
}

/// Registration, login, and the message-token contract.
///
/// The login token is an opaque per-user value rotated on every successful
/// login (issuing a new one invalidates the previous). The message token is
/// an HMAC-signed user id checked on every chat request without a token
/// table lookup.
pub struct AccountService {
    secret: String,
    invite_required: bool,
}

impl AccountService {
    pub fn new(cfg: &AuthConfig) -> Self {
        Self {
            secret: cfg.token_secret.clone(),
            invite_required: cfg.invite_required,
        }
    }

    /// Create a user, consuming a single-use invite code.
    pub fn register(
        &self,
        handle: &LogHandle,
        username: &str,
        password: &str,
        invite_code: &str,
    ) -> Result<UserRow> {
        if self.invite_required {
            let conn = handle.lock();
            let row: Option<bool> = conn
                .query_row(
                    "SELECT is_used FROM invite_codes WHERE code = ?1",
                    rusqlite::params![invite_code],
                    |row| row.get::<_, i64>(0).map(|v| v != 0),
                )
                .ok();
            match row {
                None => return Err(UserError::InviteInvalid),
                Some(true) => return Err(UserError::InviteUsed),
                Some(false) => {}
            }
        }

        if handle.get_user_by_name(username)?.is_some() {
            return Err(UserError::UsernameTaken);
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| UserError::Hash(e.to_string()))?
            .to_string();

        let user_id = Uuid::new_v4().to_string();
        let now = now_timestamp();
        {
            let conn = handle.lock();
            conn.execute(
                "INSERT INTO users (uuid, username, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![user_id, username, password_hash, now],
            )?;
            if self.invite_required {
                conn.execute(
                    "UPDATE invite_codes SET is_used = 1, used_at = ?2, user_id = ?3
                     WHERE code = ?1",
                    rusqlite::params![invite_code, now, user_id],
                )?;
            }
        }
        info!(username, "user registered");

        handle
            .get_user(&user_id)?
            .ok_or_else(|| UserError::Hash("registered row unreadable".to_string()))
    }

    /// Verify credentials, bump last-login, rotate the auth token.
    pub fn login(&self, handle: &LogHandle, username: &str, password: &str) -> Result<LoginTokens> {
        let user = handle
            .get_user_by_name(username)?
            .ok_or(UserError::InvalidCredentials)?;

        let parsed =
            PasswordHash::new(&user.password_hash).map_err(|e| UserError::Hash(e.to_string()))?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_err()
        {
            warn!(username, "login rejected: bad password");
            return Err(UserError::InvalidCredentials);
        }

        let login_token = self.rotate_auth_token(handle, &user.uuid)?;
        handle.lock().execute(
            "UPDATE users SET last_login = ?2 WHERE uuid = ?1",
            rusqlite::params![user.uuid, now_timestamp()],
        )?;

        Ok(LoginTokens {
            message_token: self.message_token(&user.uuid),
            user_id: user.uuid,
            login_token,
        })
    }

    /// Validate the previous auto-login token and issue a fresh pair.
    pub fn auto_login(&self, handle: &LogHandle, username: &str, token: &str) -> Result<LoginTokens> {
        let user = handle
            .get_user_by_name(username)?
            .ok_or(UserError::InvalidCredentials)?;
        match &user.auth_token {
            Some(stored) if stored == token => {}
            _ => return Err(UserError::InvalidCredentials),
        }

        let login_token = self.rotate_auth_token(handle, &user.uuid)?;
        Ok(LoginTokens {
            message_token: self.message_token(&user.uuid),
            user_id: user.uuid,
            login_token,
        })
    }

    /// Message token: `{user_id}.{hex(hmac_sha256(secret, user_id))}`.
    pub fn message_token(&self, user_id: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("hmac accepts any key size");
        mac.update(user_id.as_bytes());
        format!("{}.{}", user_id, hex::encode(mac.finalize().into_bytes()))
    }

    /// Token-validation contract: `{username, token}` → the opaque user id,
    /// or an auth failure. The signature check is constant-time.
    pub fn verify_message_token(
        &self,
        handle: &LogHandle,
        username: &str,
        token: &str,
    ) -> Result<String> {
        let user = handle
            .get_user_by_name(username)?
            .ok_or(UserError::TokenInvalid)?;

        let (token_user, sig_hex) = token.rsplit_once('.').ok_or(UserError::TokenInvalid)?;
        if token_user != user.uuid {
            return Err(UserError::TokenInvalid);
        }
        let sig = hex::decode(sig_hex).map_err(|_| UserError::TokenInvalid)?;

        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("hmac accepts any key size");
        mac.update(token_user.as_bytes());
        mac.verify_slice(&sig).map_err(|_| UserError::TokenInvalid)?;

        Ok(user.uuid)
    }

    fn rotate_auth_token(&self, handle: &LogHandle, user_id: &str) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        handle.lock().execute(
            "UPDATE users SET auth_token = ?2 WHERE uuid = ?1",
            rusqlite::params![user_id, token],
        )?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tianyi_store::LogStore;

    fn service() -> AccountService {
        AccountService::new(&AuthConfig {
            token_secret: "test-secret".to_string(),
            invite_required: true,
        })
    }

    fn open_handle() -> (tempfile::TempDir, LogHandle) {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path().join("users.db")).unwrap();
        let handle = store.handle().unwrap();
        (dir, handle)
    }

    fn seed_invite(handle: &LogHandle, code: &str) {
        handle
            .lock()
            .execute(
                "INSERT INTO invite_codes (code, created_at) VALUES (?1, ?2)",
                rusqlite::params![code, now_timestamp()],
            )
            .unwrap();
    }

    #[test]
    fn register_then_login_round_trip() {
        let (_dir, handle) = open_handle();
        let svc = service();
        seed_invite(&handle, "CODE-1");

        let user = svc.register(&handle, "alice", "秘密password", "CODE-1").unwrap();
        assert_eq!(user.nickname, "你");

        let tokens = svc.login(&handle, "alice", "秘密password").unwrap();
        assert_eq!(tokens.user_id, user.uuid);
        assert!(!tokens.login_token.is_empty());

        assert!(matches!(
            svc.login(&handle, "alice", "wrong").unwrap_err(),
            UserError::InvalidCredentials
        ));
    }

    #[test]
    fn invite_codes_are_single_use() {
        let (_dir, handle) = open_handle();
        let svc = service();
        seed_invite(&handle, "CODE-1");

        svc.register(&handle, "alice", "pw", "CODE-1").unwrap();
        assert!(matches!(
            svc.register(&handle, "bob", "pw", "CODE-1").unwrap_err(),
            UserError::InviteUsed
        ));
        assert!(matches!(
            svc.register(&handle, "bob", "pw", "NOPE").unwrap_err(),
            UserError::InviteInvalid
        ));
    }

    #[test]
    fn new_login_token_invalidates_previous() {
        let (_dir, handle) = open_handle();
        let svc = service();
        seed_invite(&handle, "CODE-1");
        svc.register(&handle, "alice", "pw", "CODE-1").unwrap();

        let first = svc.login(&handle, "alice", "pw").unwrap();
        let second = svc.auto_login(&handle, "alice", &first.login_token).unwrap();
        assert_ne!(first.login_token, second.login_token);

        // The rotated-out token no longer works.
        assert!(svc.auto_login(&handle, "alice", &first.login_token).is_err());
        assert!(svc.auto_login(&handle, "alice", &second.login_token).is_ok());
    }

    #[test]
    fn message_token_verifies_and_rejects_tampering() {
        let (_dir, handle) = open_handle();
        let svc = service();
        seed_invite(&handle, "CODE-1");
        let user = svc.register(&handle, "alice", "pw", "CODE-1").unwrap();

        let token = svc.message_token(&user.uuid);
        assert_eq!(
            svc.verify_message_token(&handle, "alice", &token).unwrap(),
            user.uuid
        );

        let mut tampered = token.clone();
        tampered.push('0');
        assert!(svc.verify_message_token(&handle, "alice", &tampered).is_err());

        // A token signed with a different secret fails even for the right user.
        let other = AccountService::new(&AuthConfig {
            token_secret: "other".to_string(),
            invite_required: true,
        });
        let forged = other.message_token(&user.uuid);
        assert!(svc.verify_message_token(&handle, "alice", &forged).is_err());
    }
}
