//! Pro license: one permanent boolean per user, set once payment succeeds.

use std::sync::Arc;

use crate::store::RecordStore;

#[derive(Clone)]
pub struct LicenseService {
    store: Arc<dyn RecordStore>,
}

impl LicenseService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// False for unknown users and on store failure.
    pub async fn is_pro(&self, email: &str) -> bool {
        if email.is_empty() {
            return false;
        }
        match self.store.find_user_by_email(email).await {
            Ok(user) => user.is_some_and(|u| u.pro_license),
            Err(e) => {
                tracing::error!("Failed to look up license for {}: {}", email, e);
                false
            }
        }
    }

    /// Grant the pro license. Returns false when no user record was touched.
    pub async fn activate(&self, email: &str) -> bool {
        if email.is_empty() {
            tracing::warn!("Refusing to activate pro license without an email");
            return false;
        }

        match self.store.set_pro_license(email).await {
            Ok(0) => {
                tracing::warn!("No user record for {}; pro license not activated", email);
                false
            }
            Ok(_) => {
                tracing::info!("Pro license activated for {}", email);
                true
            }
            Err(e) => {
                tracing::error!("Error activating pro license for {}: {}", email, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonFileStore;

    async fn service_with_user(email: &str) -> LicenseService {
        let store = Arc::new(JsonFileStore::in_memory());
        store.insert_user_if_absent(email).await.unwrap();
        LicenseService::new(store)
    }

    #[tokio::test]
    async fn test_activation_is_monotonic_and_idempotent() {
        let license = service_with_user("a@x.com").await;
        assert!(!license.is_pro("a@x.com").await);

        assert!(license.activate("a@x.com").await);
        assert!(license.is_pro("a@x.com").await);

        assert!(license.activate("a@x.com").await);
        assert!(license.is_pro("a@x.com").await);
    }

    #[tokio::test]
    async fn test_activation_requires_known_user() {
        let license = service_with_user("a@x.com").await;
        assert!(!license.activate("").await);
        assert!(!license.activate("ghost@x.com").await);
        assert!(!license.is_pro("ghost@x.com").await);
        assert!(!license.is_pro("").await);
    }

    #[tokio::test]
    async fn test_activation_is_per_user() {
        let license = service_with_user("a@x.com").await;
        license.store.insert_user_if_absent("b@x.com").await.unwrap();

        assert!(license.activate("a@x.com").await);
        assert!(!license.is_pro("b@x.com").await);
    }
}
