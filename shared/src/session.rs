//! Signed session cookies.
//!
//! A session is the email the identity provider accepted plus the token pair it issued.
//! It travels as `base64url(json).base64url(hmac_sha256(json))`; [`authenticate`] is the
//! only place a request's session is trusted, and it checks both signature and expiry.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use lambda_http::http::{header::COOKIE, HeaderMap};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::types::TokenPair;

pub const SESSION_COOKIE: &str = "session";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("no session cookie")]
    Missing,

    #[error("sessions are not configured")]
    NotConfigured,

    #[error("session cookie is malformed")]
    Malformed,

    #[error("session signature mismatch")]
    BadSignature,

    #[error("session expired")]
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl Session {
    pub fn new(email: &str, tokens: TokenPair, now: i64, ttl_secs: i64) -> Self {
        Self {
            email: email.to_string(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            issued_at: now,
            expires_at: now.saturating_add(ttl_secs.max(0)),
        }
    }

    /// Same session with a fresh token pair and lifetime.
    pub fn refreshed(&self, tokens: TokenPair, now: i64, ttl_secs: i64) -> Self {
        Self::new(&self.email, tokens, now, ttl_secs)
    }
}

fn sign(payload: &str, secret: &str) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    mac
}

pub fn encode(session: &Session, secret: &str) -> Result<String, serde_json::Error> {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(session)?);
    let signature = URL_SAFE_NO_PAD.encode(sign(&payload, secret).finalize().into_bytes());
    Ok(format!("{}.{}", payload, signature))
}

pub fn decode(value: &str, secret: &str, now: i64) -> Result<Session, SessionError> {
    let (payload, signature) = value.split_once('.').ok_or(SessionError::Malformed)?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| SessionError::Malformed)?;
    sign(payload, secret)
        .verify_slice(&signature)
        .map_err(|_| SessionError::BadSignature)?;

    let json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| SessionError::Malformed)?;
    let session: Session = serde_json::from_slice(&json).map_err(|_| SessionError::Malformed)?;
    if session.expires_at <= now {
        return Err(SessionError::Expired);
    }
    Ok(session)
}

/// Value of cookie `name` from the request's `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Verify the request's session cookie.
pub fn authenticate(
    headers: &HeaderMap,
    secret: Option<&str>,
    now: i64,
) -> Result<Session, SessionError> {
    let secret = secret.ok_or(SessionError::NotConfigured)?;
    let value = cookie_value(headers, SESSION_COOKIE).ok_or(SessionError::Missing)?;
    decode(value, secret, now)
}

pub fn set_cookie(value: &str, max_age_secs: i64) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, value, max_age_secs
    )
}

pub fn clear_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambda_http::http::HeaderValue;

    const SECRET: &str = "signing-secret";

    fn session(now: i64) -> Session {
        Session::new(
            "a@x.com",
            TokenPair {
                access_token: "access".into(),
                refresh_token: "refresh".into(),
                expires_in: Some(300),
            },
            now,
            3600,
        )
    }

    fn headers(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn test_valid_cookie_authenticates() {
        let value = encode(&session(1_000), SECRET).unwrap();
        let headers = headers(&format!("theme=dark; session={}; other=1", value));

        let verified = authenticate(&headers, Some(SECRET), 2_000).unwrap();
        assert_eq!(verified, session(1_000));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let value = encode(&session(1_000), SECRET).unwrap();
        let (_, signature) = value.split_once('.').unwrap();

        let mut forged = session(1_000);
        forged.email = "admin@x.com".into();
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let forged_value = format!("{}.{}", forged_payload, signature);

        assert_eq!(
            decode(&forged_value, SECRET, 2_000),
            Err(SessionError::BadSignature)
        );
        assert_eq!(
            decode(&value, "another-secret", 2_000),
            Err(SessionError::BadSignature)
        );
    }

    #[test]
    fn test_expired_and_missing() {
        let value = encode(&session(1_000), SECRET).unwrap();
        assert_eq!(decode(&value, SECRET, 4_600), Err(SessionError::Expired));
        assert_eq!(
            authenticate(&HeaderMap::new(), Some(SECRET), 0),
            Err(SessionError::Missing)
        );
        assert_eq!(
            authenticate(&headers("session=x"), None, 0),
            Err(SessionError::NotConfigured)
        );
        assert_eq!(decode("garbage", SECRET, 0), Err(SessionError::Malformed));
    }

    #[test]
    fn test_refresh_keeps_email() {
        let refreshed = session(1_000).refreshed(
            TokenPair {
                access_token: "new".into(),
                refresh_token: "new-refresh".into(),
                expires_in: None,
            },
            5_000,
            60,
        );
        assert_eq!(refreshed.email, "a@x.com");
        assert_eq!(refreshed.access_token, "new");
        assert_eq!(refreshed.expires_at, 5_060);
    }

    #[test]
    fn test_lifetime_saturates() {
        let session = Session::new(
            "a@x.com",
            TokenPair {
                access_token: "access".into(),
                refresh_token: "refresh".into(),
                expires_in: None,
            },
            1_000,
            i64::MAX,
        );
        assert_eq!(session.expires_at, i64::MAX);
        let value = encode(&session, SECRET).unwrap();
        assert!(decode(&value, SECRET, 2_000).is_ok());
    }

    #[test]
    fn test_cookie_headers() {
        assert_eq!(
            set_cookie("abc", 60),
            "session=abc; Path=/; HttpOnly; SameSite=Lax; Max-Age=60"
        );
        assert!(clear_cookie().contains("Max-Age=0"));
    }
}
