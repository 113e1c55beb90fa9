pub mod types;
pub mod config;
pub mod store;
pub mod users;
pub mod license;
pub mod images;
pub mod todos;
pub mod auth;
pub mod session;

use std::sync::Arc;

use auth::{AuthService, IdentityGateway};
use config::Settings;
use images::ImageStore;
use license::LicenseService;
use store::RecordStore;
use todos::TodoService;
use users::UserService;

/// Shared application state
///
/// Both request surfaces go through these services; none of them reaches the store
/// directly.
pub struct AppState {
    pub settings: Settings,
    pub users: UserService,
    pub license: LicenseService,
    pub todos: TodoService,
    pub auth: AuthService,
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn RecordStore>,
        images: Arc<dyn ImageStore>,
        identity: Option<Arc<dyn IdentityGateway>>,
    ) -> Arc<Self> {
        let users = UserService::new(store.clone());
        let license = LicenseService::new(store.clone());
        let todos = TodoService::new(store, license.clone(), images);
        let auth = AuthService::new(identity, users.clone());

        Arc::new(Self {
            settings,
            users,
            license,
            todos,
            auth,
        })
    }

    /// Login needs both a reachable identity provider and a key to sign sessions with.
    pub fn login_enabled(&self) -> bool {
        self.auth.is_configured() && self.settings.session_secret.is_some()
    }
}
