//! AuthN/Session subsystem (C4).
//!
//! Password login with bcrypt, random session tokens stored only as their
//! SHA-256 hash, RFC 6238 TOTP as an optional second factor, single-use
//! backup codes, scope-tagged API tokens, and an HMAC double-submit CSRF
//! token bound to the session, with prefix-based dispatch between the
//! different auth schemes.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use dplaneos_store::{ApiToken, Session, SessionKind, User};

use crate::error::AuthError;

const SESSION_TOKEN_BYTES: usize = 32;
const SLIDING_WINDOW: ChronoDuration = ChronoDuration::hours(1);
const ABSOLUTE_WINDOW: ChronoDuration = ChronoDuration::hours(12);
const API_TOKEN_PREFIX: &str = "dpl_";

/// Raw token material handed back to the caller exactly once; only its
/// hash is ever persisted.
pub struct IssuedSession {
    pub session_id: String,
    pub token: String,
    pub csrf_token: String,
    pub kind: SessionKind,
    pub must_change_password: bool,
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verifies a username/password pair against the stored bcrypt hash and, if
/// TOTP is enabled for the account, issues a `PendingTotp` session instead
/// of an `Active` one.
///
/// # Errors
///
/// Returns [`AuthError::InvalidCredentials`] on any mismatch (including a
/// nonexistent username — the same error is returned to avoid leaking
/// account existence), or [`AuthError::AccountDisabled`].
pub async fn login(
    pool: &SqlitePool,
    username: &str,
    password: &str,
    client_ip: Option<&str>,
) -> Result<IssuedSession, AuthError> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    let user = user.ok_or(AuthError::InvalidCredentials)?;

    if user.disabled {
        return Err(AuthError::AccountDisabled);
    }
    let matches = bcrypt::verify(password, &user.password_hash).unwrap_or(false);
    if !matches {
        return Err(AuthError::InvalidCredentials);
    }

    let kind = if user.totp_enabled { SessionKind::PendingTotp } else { SessionKind::Active };
    issue_session(pool, &user.id, kind, client_ip, user.must_change_password).await
}

async fn issue_session(
    pool: &SqlitePool,
    user_id: &str,
    kind: SessionKind,
    client_ip: Option<&str>,
    must_change_password: bool,
) -> Result<IssuedSession, AuthError> {
    let session_id = Uuid::new_v4().to_string();
    let token = random_token(SESSION_TOKEN_BYTES);
    let token_hash = sha256_hex(&token);
    let csrf_secret = random_token(SESSION_TOKEN_BYTES);
    let now = Utc::now();
    let absolute_expires_at = now + ABSOLUTE_WINDOW;

    sqlx::query(
        "INSERT INTO sessions (id, user_id, token_hash, kind, csrf_secret, created_at, last_seen_at, absolute_expires_at, client_ip) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&session_id)
    .bind(user_id)
    .bind(&token_hash)
    .bind(kind.as_str())
    .bind(&csrf_secret)
    .bind(now)
    .bind(now)
    .bind(absolute_expires_at)
    .bind(client_ip)
    .execute(pool)
    .await?;

    let csrf_token = csrf_token_for(&session_id, &csrf_secret);
    Ok(IssuedSession { session_id, token, csrf_token, kind, must_change_password })
}

/// Looks up a session by its raw token, enforcing both the sliding and
/// absolute expiry windows and bumping `last_seen_at` on success.
///
/// # Errors
///
/// Returns [`AuthError::SessionNotFound`] or [`AuthError::SessionExpired`].
pub async fn authenticate_session(pool: &SqlitePool, token: &str) -> Result<Session, AuthError> {
    let token_hash = sha256_hex(token);
    let session: Option<Session> = sqlx::query_as("SELECT * FROM sessions WHERE token_hash = ?")
        .bind(&token_hash)
        .fetch_optional(pool)
        .await?;
    let session = session.ok_or(AuthError::SessionNotFound)?;

    let now = Utc::now();
    if now > session.absolute_expires_at || now > session.last_seen_at + SLIDING_WINDOW {
        sqlx::query("DELETE FROM sessions WHERE id = ?").bind(&session.id).execute(pool).await?;
        return Err(AuthError::SessionExpired);
    }

    sqlx::query("UPDATE sessions SET last_seen_at = ? WHERE id = ?")
        .bind(now)
        .bind(&session.id)
        .execute(pool)
        .await?;

    Ok(session)
}

/// Verifies a TOTP code and promotes a pending session to active. Backup
/// codes are accepted in place of a TOTP code and are consumed (removed
/// from the stored set) on success.
///
/// # Errors
///
/// Returns [`AuthError::TotpNotEnabled`], [`AuthError::TotpInvalid`].
pub async fn verify_totp(pool: &SqlitePool, session: &Session, code: &str) -> Result<(), AuthError> {
    let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&session.user_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;

    let secret = user.totp_secret.as_deref().ok_or(AuthError::TotpNotEnabled)?;
    let valid_totp = check_totp_code(secret, code);
    let valid_backup = !valid_totp && consume_backup_code(pool, &user, code).await?;

    if !valid_totp && !valid_backup {
        return Err(AuthError::TotpInvalid);
    }

    sqlx::query("UPDATE sessions SET kind = 'active' WHERE id = ?")
        .bind(&session.id)
        .execute(pool)
        .await?;
    Ok(())
}

fn check_totp_code(secret: &str, code: &str) -> bool {
    let Ok(secret_bytes) = Secret::Encoded(secret.to_string()).to_bytes() else {
        return false;
    };
    let Ok(totp) = TOTP::new(Algorithm::SHA1, 6, 1, 30, secret_bytes) else {
        return false;
    };
    totp.check_current(code).unwrap_or(false)
}

async fn consume_backup_code(pool: &SqlitePool, user: &User, code: &str) -> Result<bool, AuthError> {
    let Some(raw) = &user.backup_codes else { return Ok(false) };
    let hashes: Vec<String> = serde_json::from_str(raw).unwrap_or_default();
    let Some(position) = hashes.iter().position(|h| bcrypt::verify(code, h).unwrap_or(false)) else {
        return Ok(false);
    };

    let mut remaining = hashes;
    remaining.remove(position);
    let updated = serde_json::to_string(&remaining).unwrap_or_default();
    sqlx::query("UPDATE users SET backup_codes = ? WHERE id = ?")
        .bind(updated)
        .bind(&user.id)
        .execute(pool)
        .await?;
    Ok(true)
}

fn csrf_token_for(session_id: &str, csrf_secret: &str) -> String {
    #[allow(clippy::expect_used)]
    let mut mac = Hmac::<Sha256>::new_from_slice(csrf_secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(session_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Double-submit CSRF check: the header token must match the HMAC computed
/// from the session's own secret, so a cross-site request (which can't read
/// the session's secret) can never forge a match.
///
/// # Errors
///
/// Returns [`AuthError::CsrfMismatch`].
pub fn verify_csrf(session: &Session, supplied_token: &str) -> Result<(), AuthError> {
    let expected = csrf_token_for(&session.id, &session.csrf_secret);
    if expected == supplied_token {
        Ok(())
    } else {
        Err(AuthError::CsrfMismatch)
    }
}

/// Generates a new `dpl_`-prefixed API token and returns both the raw token
/// (shown once) and the hash to persist via the caller's own insert.
#[must_use]
pub fn generate_api_token() -> (String, String) {
    let token = format!("{API_TOKEN_PREFIX}{}", random_token(SESSION_TOKEN_BYTES));
    let hash = sha256_hex(&token);
    (token, hash)
}

#[must_use]
pub fn hash_api_token(token: &str) -> String {
    sha256_hex(token)
}

/// Generates and persists a new API token for `user_id`, returning the raw
/// token exactly once; only its hash lands in storage.
///
/// # Errors
///
/// Returns [`AuthError::Store`] on a database failure.
pub async fn create_api_token(pool: &SqlitePool, user_id: &str, scope: &str) -> Result<String, AuthError> {
    let (token, hash) = generate_api_token();
    sqlx::query("INSERT INTO api_tokens (id, user_id, token_hash, scope, created_at) VALUES (?, ?, ?, ?, ?)")
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(&hash)
        .bind(scope)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(token)
}

/// Authenticates a bearer token by its hash, rejecting unknown or revoked
/// tokens, and bumps `last_used_at` on success.
///
/// # Errors
///
/// Returns [`AuthError::ApiTokenInvalid`] if the token doesn't resolve to an
/// active, unrevoked record.
pub async fn authenticate_api_token(pool: &SqlitePool, token: &str) -> Result<ApiToken, AuthError> {
    let hash = sha256_hex(token);
    let record: Option<ApiToken> =
        sqlx::query_as("SELECT * FROM api_tokens WHERE token_hash = ? AND revoked = 0").bind(&hash).fetch_optional(pool).await?;
    let record = record.ok_or(AuthError::ApiTokenInvalid)?;

    sqlx::query("UPDATE api_tokens SET last_used_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(&record.id)
        .execute(pool)
        .await?;
    Ok(record)
}

#[must_use]
pub fn session_absolute_expiry_from(now: DateTime<Utc>) -> DateTime<Utc> {
    now + ABSOLUTE_WINDOW
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn csrf_token_is_deterministic_per_session() {
        let token_a = csrf_token_for("session-1", "secret-1");
        let token_b = csrf_token_for("session-1", "secret-1");
        let token_c = csrf_token_for("session-1", "secret-2");
        assert_eq!(token_a, token_b);
        assert_ne!(token_a, token_c);
    }

    #[test]
    fn api_token_has_expected_prefix_and_hashes_consistently() {
        let (token, hash) = generate_api_token();
        assert!(token.starts_with(API_TOKEN_PREFIX));
        assert_eq!(hash_api_token(&token), hash);
    }

    #[test]
    fn bcrypt_roundtrip() {
        let hash = bcrypt::hash("hunter2", 10).unwrap();
        assert!(bcrypt::verify("hunter2", &hash).unwrap());
        assert!(!bcrypt::verify("wrong", &hash).unwrap());
    }
}
