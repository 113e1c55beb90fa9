//! Runtime settings read from the environment.
//!
//! Identity settings and the session secret are optional: when any of them is missing the
//! login path answers with 503 instead of the process refusing to start.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_DB_PATH: &str = "db.json";
const DEFAULT_TABLE_NAME: &str = "protodo";
const DEFAULT_UPLOAD_DIR: &str = "static/uploads";
const DEFAULT_UPLOAD_BUCKET: &str = "protodo-uploads";
const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 60 * 60;
const MAX_SESSION_TTL_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown value {value:?} for {key}")]
    UnknownValue { key: &'static str, value: String },

    #[error("invalid number {value:?} for {key}")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    File { path: PathBuf },
    Dynamo { table_name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageBackend {
    Local { dir: PathBuf },
    S3 { bucket: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeycloakSettings {
    pub uri: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CognitoSettings {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdentitySettings {
    Keycloak(KeycloakSettings),
    Cognito(CognitoSettings),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub store: StoreBackend,
    pub images: ImageBackend,
    /// `None` when the selected provider is missing any required value.
    pub identity: Option<IdentitySettings>,
    pub redirect_uri: Option<String>,
    pub session_secret: Option<String>,
    pub session_ttl_secs: i64,
}

impl Settings {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store = match var("STORE_BACKEND").as_deref() {
            None | Some("file") => StoreBackend::File {
                path: var("DB_PATH")
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
                    .into(),
            },
            Some("dynamodb") => StoreBackend::Dynamo {
                table_name: var("TABLE_NAME").unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string()),
            },
            Some(other) => {
                return Err(ConfigError::UnknownValue {
                    key: "STORE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let images = match var("IMAGE_BACKEND").as_deref() {
            None | Some("local") => ImageBackend::Local {
                dir: var("UPLOAD_DIR")
                    .unwrap_or_else(|| DEFAULT_UPLOAD_DIR.to_string())
                    .into(),
            },
            Some("s3") => ImageBackend::S3 {
                bucket: var("UPLOAD_BUCKET").unwrap_or_else(|| DEFAULT_UPLOAD_BUCKET.to_string()),
            },
            Some(other) => {
                return Err(ConfigError::UnknownValue {
                    key: "IMAGE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let identity = match var("IDENTITY_PROVIDER").as_deref() {
            None | Some("keycloak") => {
                match (var("KEYCLOAK_URI"), var("REALM"), var("CLIENT_ID"), var("CLIENT_SECRET")) {
                    (Some(uri), Some(realm), Some(client_id), Some(client_secret)) => {
                        Some(IdentitySettings::Keycloak(KeycloakSettings {
                            uri,
                            realm,
                            client_id,
                            client_secret,
                        }))
                    }
                    _ => None,
                }
            }
            Some("cognito") => match (var("COGNITO_CLIENT_ID"), var("COGNITO_CLIENT_SECRET")) {
                (Some(client_id), Some(client_secret)) => {
                    Some(IdentitySettings::Cognito(CognitoSettings {
                        client_id,
                        client_secret,
                    }))
                }
                _ => None,
            },
            Some(other) => {
                return Err(ConfigError::UnknownValue {
                    key: "IDENTITY_PROVIDER",
                    value: other.to_string(),
                })
            }
        };
        if identity.is_none() {
            tracing::warn!("Identity provider settings incomplete; login is disabled");
        }

        let session_secret = var("SESSION_SECRET");
        if session_secret.is_none() {
            tracing::warn!("SESSION_SECRET not set; login is disabled");
        }

        let session_ttl_secs = match var("SESSION_TTL_SECS") {
            Some(raw) => match raw.parse::<i64>() {
                Ok(secs) if (1..=MAX_SESSION_TTL_SECS).contains(&secs) => secs,
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        key: "SESSION_TTL_SECS",
                        value: raw,
                    })
                }
            },
            None => DEFAULT_SESSION_TTL_SECS,
        };

        Ok(Self {
            store,
            images,
            identity,
            redirect_uri: var("REDIRECT_URI"),
            session_secret,
            session_ttl_secs,
        })
    }
}
