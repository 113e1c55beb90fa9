//! Todo operations shared by the form and query surfaces.
//!
//! Every operation is scoped to the caller's email. Image attachments are silently dropped
//! for users without a pro license; update and delete report ids that are missing or owned
//! by someone else instead of ignoring them.

use std::sync::Arc;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::images::{self, ImageError, ImageStore};
use crate::license::LicenseService;
use crate::store::{RecordStore, StoreError};
use crate::types::{ImageUpload, NewTodo, Todo, TodoPatch};

/// Accepted input format, as produced by `<input type="datetime-local">`.
pub const INPUT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";
const STORED_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Error)]
pub enum TodoError {
    #[error("Invalid date format")]
    InvalidTime(String),

    #[error("Todo {0} not found")]
    NotFound(u64),

    #[error("Todo {0} belongs to another user")]
    Forbidden(u64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Parse `YYYY-MM-DDTHH:MM` and return the stored ISO-8601 form.
pub fn normalize_time(raw: &str) -> Result<String, TodoError> {
    NaiveDateTime::parse_from_str(raw, INPUT_TIME_FORMAT)
        .map(|t| t.format(STORED_TIME_FORMAT).to_string())
        .map_err(|_| TodoError::InvalidTime(raw.to_string()))
}

#[derive(Clone)]
pub struct TodoService {
    store: Arc<dyn RecordStore>,
    license: LicenseService,
    images: Arc<dyn ImageStore>,
}

impl TodoService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        license: LicenseService,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            store,
            license,
            images,
        }
    }

    pub async fn list(&self, email: &str) -> Result<Vec<Todo>, TodoError> {
        Ok(self.store.find_todos_by_email(email).await?)
    }

    pub async fn create(
        &self,
        email: &str,
        title: &str,
        description: &str,
        time: &str,
        images: Vec<String>,
    ) -> Result<Todo, TodoError> {
        let time = normalize_time(time)?;
        let images = self.gate_images(email, images).await;

        let todo = self
            .store
            .insert_todo(NewTodo {
                email: email.to_string(),
                title: title.to_string(),
                description: description.to_string(),
                time,
                images,
            })
            .await?;
        tracing::info!("Created todo {} for {}", todo.id, email);
        Ok(todo)
    }

    /// Apply a partial update. `patch.time` is given in input format and validated before
    /// anything is written.
    pub async fn update(&self, email: &str, id: u64, patch: TodoPatch) -> Result<Todo, TodoError> {
        let time = patch.time.as_deref().map(normalize_time).transpose()?;
        self.owned(email, id).await?;

        let images = match patch.images {
            Some(images) => Some(self.gate_images(email, images).await),
            None => None,
        };
        let patch = TodoPatch {
            time,
            images,
            ..patch
        };

        let todo = self
            .store
            .update_todo(id, &patch)
            .await?
            .ok_or(TodoError::NotFound(id))?;
        tracing::info!("Updated todo {} for {}", id, email);
        Ok(todo)
    }

    /// Replace a todo's images with freshly uploaded files along with the rest of `patch`.
    /// Time and ownership are checked before any file is written.
    pub async fn update_with_uploads(
        &self,
        email: &str,
        id: u64,
        patch: TodoPatch,
        uploads: &[ImageUpload],
    ) -> Result<Todo, TodoError> {
        if let Some(time) = patch.time.as_deref() {
            normalize_time(time)?;
        }
        self.owned(email, id).await?;

        let images = self.store_uploads(email, uploads).await?;
        self.update(
            email,
            id,
            TodoPatch {
                images: Some(images),
                ..patch
            },
        )
        .await
    }

    pub async fn delete(&self, email: &str, id: u64) -> Result<(), TodoError> {
        self.owned(email, id).await?;
        if !self.store.remove_todo(id).await? {
            return Err(TodoError::NotFound(id));
        }
        tracing::info!("Deleted todo {} for {}", id, email);
        Ok(())
    }

    /// Store uploaded image files for a pro user. Non-pro users get an empty list and
    /// nothing is written.
    pub async fn store_uploads(
        &self,
        email: &str,
        uploads: &[ImageUpload],
    ) -> Result<Vec<String>, TodoError> {
        if uploads.is_empty() {
            return Ok(Vec::new());
        }
        if !self.license.is_pro(email).await {
            tracing::info!("Ignoring {} upload(s) from non-pro user {}", uploads.len(), email);
            return Ok(Vec::new());
        }
        Ok(images::save_uploads(self.images.as_ref(), uploads).await?)
    }

    async fn gate_images(&self, email: &str, images: Vec<String>) -> Vec<String> {
        if images.is_empty() || self.license.is_pro(email).await {
            images
        } else {
            tracing::info!("Dropping images for non-pro user {}", email);
            Vec::new()
        }
    }

    async fn owned(&self, email: &str, id: u64) -> Result<Todo, TodoError> {
        let todo = self
            .store
            .find_todo_by_id(id)
            .await?
            .ok_or(TodoError::NotFound(id))?;
        if todo.email != email {
            tracing::warn!("{} attempted to modify todo {} owned by another user", email, id);
            return Err(TodoError::Forbidden(id));
        }
        Ok(todo)
    }
}
