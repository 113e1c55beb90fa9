//! Record store: durable users and todos behind one typed repository trait.
//!
//! Missing ids are reported through `None`, `false` or a zero count and never as errors;
//! deciding what a missing record means is left to the services.

mod dynamo;
mod json_file;

pub use dynamo::DynamoStore;
pub use json_file::JsonFileStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{NewTodo, Todo, TodoPatch, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store document is malformed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a todo and return it with its assigned id.
    async fn insert_todo(&self, todo: NewTodo) -> StoreResult<Todo>;

    async fn find_todo_by_id(&self, id: u64) -> StoreResult<Option<Todo>>;

    /// All todos owned by `email`, in insertion order.
    async fn find_todos_by_email(&self, email: &str) -> StoreResult<Vec<Todo>>;

    /// Apply `patch` and return the updated record, or `None` when `id` is unknown.
    async fn update_todo(&self, id: u64, patch: &TodoPatch) -> StoreResult<Option<Todo>>;

    /// Returns whether a record was removed.
    async fn remove_todo(&self, id: u64) -> StoreResult<bool>;

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    /// Create `{email, pro_license: false}` unless a user with that email exists.
    /// The flag reports whether a record was created.
    async fn insert_user_if_absent(&self, email: &str) -> StoreResult<(User, bool)>;

    /// Set the pro flag and return how many user records were touched.
    async fn set_pro_license(&self, email: &str) -> StoreResult<usize>;
}
