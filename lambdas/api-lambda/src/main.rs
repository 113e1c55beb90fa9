use aws_config::SdkConfig;
use aws_sdk_cognitoidentityprovider::Client as CognitoClient;
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_s3::Client as S3Client;
use lambda_http::{run, service_fn, tracing, Error, Request};
use protodo_shared::auth::{CognitoGateway, IdentityGateway, KeycloakGateway};
use protodo_shared::config::{IdentitySettings, ImageBackend, Settings, StoreBackend};
use protodo_shared::images::{ImageStore, LocalImageStore, S3ImageStore};
use protodo_shared::store::{DynamoStore, JsonFileStore, RecordStore};
use protodo_shared::AppState;
use std::sync::Arc;
use tokio::sync::OnceCell;

mod graphql;
mod http_handler;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing::init_default_subscriber();

    let settings = Settings::from_env()?;

    // AWS config is only loaded when a configured backend needs it
    let aws: OnceCell<SdkConfig> = OnceCell::new();

    let store: Arc<dyn RecordStore> = match &settings.store {
        StoreBackend::File { path } => {
            tracing::info!("Using file store at {}", path.display());
            Arc::new(JsonFileStore::open(path).await?)
        }
        StoreBackend::Dynamo { table_name } => {
            tracing::info!("Using DynamoDB table {}", table_name);
            let config = aws.get_or_init(aws_config::load_from_env).await;
            Arc::new(DynamoStore::new(DynamoClient::new(config), table_name))
        }
    };

    let images: Arc<dyn ImageStore> = match &settings.images {
        ImageBackend::Local { dir } => Arc::new(LocalImageStore::new(dir)),
        ImageBackend::S3 { bucket } => {
            let config = aws.get_or_init(aws_config::load_from_env).await;
            Arc::new(S3ImageStore::new(S3Client::new(config), bucket))
        }
    };

    let identity: Option<Arc<dyn IdentityGateway>> = match &settings.identity {
        Some(IdentitySettings::Keycloak(keycloak)) => Some(Arc::new(KeycloakGateway::new(keycloak))),
        Some(IdentitySettings::Cognito(cognito)) => {
            let config = aws.get_or_init(aws_config::load_from_env).await;
            Some(Arc::new(CognitoGateway::new(CognitoClient::new(config), cognito)))
        }
        None => None,
    };

    let state = AppState::new(settings, store, images, identity);
    if !state.login_enabled() {
        tracing::warn!("Identity provider or SESSION_SECRET missing; login is disabled");
    }

    run(service_fn(move |event: Request| {
        let state = Arc::clone(&state);
        async move { http_handler::function_handler(event, state).await }
    }))
    .await
}
