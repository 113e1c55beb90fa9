use serde::{Deserialize, Serialize};

// ========== USER ==========
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct User {
    pub email: String,
    pub pro_license: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddUserRequest {
    pub email: String,
}

// ========== TODO ==========
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Todo {
    pub id: u64,
    pub email: String,
    pub title: String,
    pub description: String,
    pub time: String, // YYYY-MM-DDTHH:MM:SS
    pub images: Vec<String>,
}

/// A todo about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTodo {
    pub email: String,
    pub title: String,
    pub description: String,
    pub time: String,
    pub images: Vec<String>,
}

impl NewTodo {
    pub fn with_id(self, id: u64) -> Todo {
        Todo {
            id,
            email: self.email,
            title: self.title,
            description: self.description,
            time: self.time,
            images: self.images,
        }
    }
}

/// Partial update. `None` leaves the stored field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TodoPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub time: Option<String>,
    pub images: Option<Vec<String>>,
}

impl TodoPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.time.is_none()
            && self.images.is_none()
    }

    pub fn apply(&self, todo: &mut Todo) {
        if let Some(title) = &self.title {
            todo.title = title.clone();
        }
        if let Some(description) = &self.description {
            todo.description = description.clone();
        }
        if let Some(time) = &self.time {
            todo.time = time.clone();
        }
        if let Some(images) = &self.images {
            todo.images = images.clone();
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTodoRequest {
    pub email: String,
    pub title: String,
    pub description: String,
    pub time: String,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTodoRequest {
    pub id: u64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub time: Option<String>,
    pub images: Option<Vec<String>>,
}

// ========== IMAGE ==========
#[derive(Debug, Deserialize, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub file_data: String, // base64 encoded
}

// ========== SESSION ==========
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Todo {
        NewTodo {
            email: "a@x.com".into(),
            title: "T".into(),
            description: "D".into(),
            time: "2024-01-01T10:00:00".into(),
            images: vec!["static/uploads/a.png".into()],
        }
        .with_id(7)
    }

    #[test]
    fn test_patch_only_touches_supplied_fields() {
        let mut todo = sample();
        let patch = TodoPatch {
            title: Some("New".into()),
            ..TodoPatch::default()
        };
        patch.apply(&mut todo);

        assert_eq!(todo.title, "New");
        assert_eq!(todo.description, "D");
        assert_eq!(todo.images, vec!["static/uploads/a.png".to_string()]);
    }

    #[test]
    fn test_empty_image_list_replaces_existing() {
        let mut todo = sample();
        TodoPatch {
            images: Some(vec![]),
            ..TodoPatch::default()
        }
        .apply(&mut todo);
        assert!(todo.images.is_empty());
        assert!(TodoPatch::default().is_empty());
    }
}
