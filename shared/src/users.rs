use std::sync::Arc;

use crate::store::{RecordStore, StoreError};
use crate::types::User;

#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn RecordStore>,
}

impl UserService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.store.find_user_by_email(email).await
    }

    /// Declare a user; repeated calls return the existing record unchanged.
    pub async fn ensure(&self, email: &str) -> Result<User, StoreError> {
        let (user, created) = self.store.insert_user_if_absent(email).await?;
        if created {
            tracing::info!("Created user record for {}", email);
        }
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonFileStore;

    #[tokio::test]
    async fn test_ensure_does_not_reset_license() {
        let store = Arc::new(JsonFileStore::in_memory());
        let users = UserService::new(store.clone());

        let user = users.ensure("a@x.com").await.unwrap();
        assert!(!user.pro_license);

        store.set_pro_license("a@x.com").await.unwrap();
        let again = users.ensure("a@x.com").await.unwrap();
        assert!(again.pro_license);
        assert_eq!(users.get("a@x.com").await.unwrap(), Some(again));
        assert_eq!(users.get("b@x.com").await.unwrap(), None);
    }
}
