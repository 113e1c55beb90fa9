use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_cognitoidentityprovider::types::AuthFlowType;
use aws_sdk_cognitoidentityprovider::Client as CognitoClient;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use crate::config::{CognitoSettings, KeycloakSettings};
use crate::store::StoreError;
use crate::types::TokenPair;
use crate::users::UserService;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("login is not configured")]
    NotConfigured,

    #[error("identity provider rejected the credentials: {0}")]
    Rejected(String),

    #[error("identity provider unreachable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An external identity provider that issues tokens for credentials.
/// Exactly one call per operation; failures are surfaced, never retried.
#[async_trait]
pub trait IdentityGateway: Send + Sync {
    async fn password_grant(&self, username: &str, password: &str)
        -> Result<TokenPair, LoginError>;

    async fn refresh(&self, username: &str, refresh_token: &str) -> Result<TokenPair, LoginError>;
}

type HmacSha256 = Hmac<Sha256>;

/// Compute the SECRET_HASH for Cognito authentication
fn compute_secret_hash(username: &str, client_id: &str, client_secret: &str) -> String {
    let message = format!("{}{}", username, client_id);
    let mut mac = HmacSha256::new_from_slice(client_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    let result = mac.finalize();
    general_purpose::STANDARD.encode(result.into_bytes())
}

pub struct CognitoGateway {
    client: CognitoClient,
    client_id: String,
    client_secret: String,
}

impl CognitoGateway {
    pub fn new(client: CognitoClient, settings: &CognitoSettings) -> Self {
        Self {
            client,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
        }
    }
}

#[async_trait]
impl IdentityGateway for CognitoGateway {
    async fn password_grant(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenPair, LoginError> {
        let secret_hash = compute_secret_hash(username, &self.client_id, &self.client_secret);

        let response = self
            .client
            .initiate_auth()
            .auth_flow(AuthFlowType::UserPasswordAuth)
            .client_id(&self.client_id)
            .auth_parameters("USERNAME", username)
            .auth_parameters("PASSWORD", password)
            .auth_parameters("SECRET_HASH", &secret_hash)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Cognito authentication error: {:?}", e);
                LoginError::Rejected(format!("{}", e))
            })?;

        let result = response.authentication_result().ok_or_else(|| {
            tracing::error!("No authentication result returned");
            LoginError::Rejected("no authentication result returned".to_string())
        })?;

        Ok(TokenPair {
            access_token: result.access_token().unwrap_or_default().to_string(),
            refresh_token: result.refresh_token().unwrap_or_default().to_string(),
            expires_in: Some(i64::from(result.expires_in())),
        })
    }

    async fn refresh(&self, username: &str, refresh_token: &str) -> Result<TokenPair, LoginError> {
        let secret_hash = compute_secret_hash(username, &self.client_id, &self.client_secret);

        let response = self
            .client
            .initiate_auth()
            .auth_flow(AuthFlowType::RefreshTokenAuth)
            .client_id(&self.client_id)
            .auth_parameters("REFRESH_TOKEN", refresh_token)
            .auth_parameters("SECRET_HASH", &secret_hash)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Cognito refresh error: {:?}", e);
                LoginError::Rejected(format!("{}", e))
            })?;

        let result = response
            .authentication_result()
            .ok_or_else(|| LoginError::Rejected("no authentication result returned".to_string()))?;

        // Cognito does not rotate refresh tokens.
        Ok(TokenPair {
            access_token: result.access_token().unwrap_or_default().to_string(),
            refresh_token: result
                .refresh_token()
                .unwrap_or(refresh_token)
                .to_string(),
            expires_in: Some(i64::from(result.expires_in())),
        })
    }
}

#[derive(Deserialize)]
struct KeycloakTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    expires_in: Option<i64>,
}

/// OpenID Connect token endpoint of a Keycloak realm.
pub fn keycloak_token_url(uri: &str, realm: &str) -> String {
    format!(
        "{}/realms/{}/protocol/openid-connect/token",
        uri.trim_end_matches('/'),
        realm
    )
}

pub struct KeycloakGateway {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl KeycloakGateway {
    pub fn new(settings: &KeycloakSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: keycloak_token_url(&settings.uri, &settings.realm),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
        }
    }

    async fn exchange(&self, form: &[(&str, &str)]) -> Result<TokenPair, LoginError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Keycloak token request failed: {}", e);
                LoginError::Upstream(e.to_string())
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            tracing::warn!("Keycloak token endpoint answered {}", status);
            return Err(LoginError::Rejected(format!("token endpoint returned {}", status)));
        }

        let tokens: KeycloakTokenResponse = response
            .json()
            .await
            .map_err(|e| LoginError::Upstream(format!("invalid token response: {}", e)))?;
        Ok(TokenPair {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_in: tokens.expires_in,
        })
    }
}

#[async_trait]
impl IdentityGateway for KeycloakGateway {
    async fn password_grant(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenPair, LoginError> {
        self.exchange(&[
            ("grant_type", "password"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("username", username),
            ("password", password),
        ])
        .await
    }

    async fn refresh(&self, _username: &str, refresh_token: &str) -> Result<TokenPair, LoginError> {
        self.exchange(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

/// Login on top of an optional gateway; without one every login fails with
/// [`LoginError::NotConfigured`].
#[derive(Clone)]
pub struct AuthService {
    gateway: Option<Arc<dyn IdentityGateway>>,
    users: UserService,
}

impl AuthService {
    pub fn new(gateway: Option<Arc<dyn IdentityGateway>>, users: UserService) -> Self {
        Self { gateway, users }
    }

    pub fn is_configured(&self) -> bool {
        self.gateway.is_some()
    }

    /// Exchange credentials for tokens and make sure the user record exists.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, LoginError> {
        let gateway = self.gateway.as_ref().ok_or(LoginError::NotConfigured)?;

        tracing::info!("Authenticating user: {}", email);
        let tokens = gateway.password_grant(email, password).await?;
        tracing::info!("Authentication successful for user: {}", email);

        self.users.ensure(email).await?;
        Ok(tokens)
    }

    pub async fn refresh(&self, email: &str, refresh_token: &str) -> Result<TokenPair, LoginError> {
        let gateway = self.gateway.as_ref().ok_or(LoginError::NotConfigured)?;
        gateway.refresh(email, refresh_token).await
    }
}
