use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{RecordStore, StoreResult};
use crate::types::{NewTodo, Todo, TodoPatch, User};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TodoRecord {
    email: String,
    title: String,
    description: String,
    time: String,
    #[serde(default)]
    images: Vec<String>,
}

impl TodoRecord {
    fn to_todo(&self, id: u64) -> Todo {
        Todo {
            id,
            email: self.email.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            time: self.time.clone(),
            images: self.images.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    email: String,
    #[serde(rename = "_pro_license", default)]
    pro_license: bool,
}

impl UserRecord {
    fn to_user(&self) -> User {
        User {
            email: self.email.clone(),
            pro_license: self.pro_license,
        }
    }
}

/// On-disk document: `{"todos": {"<id>": {...}}, "users": {"<id>": {...}}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    todos: BTreeMap<u64, TodoRecord>,
    #[serde(default)]
    users: BTreeMap<u64, UserRecord>,
}

fn next_id<V>(table: &BTreeMap<u64, V>) -> u64 {
    table.keys().next_back().map_or(1, |last| last + 1)
}

/// JSON document store. Every operation runs under one lock and writes the whole document
/// back before releasing it, so read-modify-write sequences such as
/// [`RecordStore::insert_user_if_absent`] cannot interleave.
pub struct JsonFileStore {
    path: Option<PathBuf>,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    /// Open (or lazily create) the document at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Tables::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            "Opened record store at {} ({} todos, {} users)",
            path.display(),
            tables.todos.len(),
            tables.users.len()
        );

        Ok(Self {
            path: Some(path),
            tables: Mutex::new(tables),
        })
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: Mutex::new(Tables::default()),
        }
    }

    async fn persist(&self, tables: &Tables) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec(tables)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Persist `next` and only then make it the live document, so a failed write leaves
    /// memory as it was.
    async fn commit(&self, tables: &mut Tables, next: Tables) -> StoreResult<()> {
        self.persist(&next).await?;
        *tables = next;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn insert_todo(&self, todo: NewTodo) -> StoreResult<Todo> {
        let mut tables = self.tables.lock().await;
        let id = next_id(&tables.todos);
        let mut next = tables.clone();
        next.todos.insert(
            id,
            TodoRecord {
                email: todo.email.clone(),
                title: todo.title.clone(),
                description: todo.description.clone(),
                time: todo.time.clone(),
                images: todo.images.clone(),
            },
        );
        self.commit(&mut tables, next).await?;
        Ok(todo.with_id(id))
    }

    async fn find_todo_by_id(&self, id: u64) -> StoreResult<Option<Todo>> {
        let tables = self.tables.lock().await;
        Ok(tables.todos.get(&id).map(|r| r.to_todo(id)))
    }

    async fn find_todos_by_email(&self, email: &str) -> StoreResult<Vec<Todo>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .todos
            .iter()
            .filter(|(_, r)| r.email == email)
            .map(|(id, r)| r.to_todo(*id))
            .collect())
    }

    async fn update_todo(&self, id: u64, patch: &TodoPatch) -> StoreResult<Option<Todo>> {
        let mut tables = self.tables.lock().await;
        let Some(record) = tables.todos.get(&id) else {
            return Ok(None);
        };

        let mut todo = record.to_todo(id);
        patch.apply(&mut todo);
        let mut next = tables.clone();
        next.todos.insert(
            id,
            TodoRecord {
                email: todo.email.clone(),
                title: todo.title.clone(),
                description: todo.description.clone(),
                time: todo.time.clone(),
                images: todo.images.clone(),
            },
        );
        self.commit(&mut tables, next).await?;
        Ok(Some(todo))
    }

    async fn remove_todo(&self, id: u64) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        if next.todos.remove(&id).is_none() {
            return Ok(false);
        }
        self.commit(&mut tables, next).await?;
        Ok(true)
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.email == email)
            .map(UserRecord::to_user))
    }

    async fn insert_user_if_absent(&self, email: &str) -> StoreResult<(User, bool)> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.users.values().find(|u| u.email == email) {
            return Ok((existing.to_user(), false));
        }

        let record = UserRecord {
            email: email.to_string(),
            pro_license: false,
        };
        let user = record.to_user();
        let id = next_id(&tables.users);
        let mut next = tables.clone();
        next.users.insert(id, record);
        self.commit(&mut tables, next).await?;
        Ok((user, true))
    }

    async fn set_pro_license(&self, email: &str) -> StoreResult<usize> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        let mut touched = 0;
        for user in next.users.values_mut().filter(|u| u.email == email) {
            user.pro_license = true;
            touched += 1;
        }
        if touched > 0 {
            self.commit(&mut tables, next).await?;
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_todo(email: &str, title: &str) -> NewTodo {
        NewTodo {
            email: email.into(),
            title: title.into(),
            description: "D".into(),
            time: "2024-01-01T10:00:00".into(),
            images: vec![],
        }
    }

    #[tokio::test]
    async fn test_ids_are_assigned_in_order() {
        let store = JsonFileStore::in_memory();
        let first = store.insert_todo(new_todo("a@x.com", "one")).await.unwrap();
        let second = store.insert_todo(new_todo("a@x.com", "two")).await.unwrap();
        store.insert_todo(new_todo("b@x.com", "other")).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);

        let titles: Vec<_> = store
            .find_todos_by_email("a@x.com")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_missing_ids_are_reported_not_errors() {
        let store = JsonFileStore::in_memory();
        let patch = TodoPatch {
            title: Some("x".into()),
            ..TodoPatch::default()
        };
        assert_eq!(store.update_todo(42, &patch).await.unwrap(), None);
        assert!(!store.remove_todo(42).await.unwrap());
        assert_eq!(store.set_pro_license("nobody@x.com").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_user_if_absent_is_idempotent() {
        let store = JsonFileStore::in_memory();
        let (user, created) = store.insert_user_if_absent("a@x.com").await.unwrap();
        assert!(created);
        assert!(!user.pro_license);

        store.set_pro_license("a@x.com").await.unwrap();
        let (user, created) = store.insert_user_if_absent("a@x.com").await.unwrap();
        assert!(!created);
        assert!(user.pro_license);
    }

    #[tokio::test]
    async fn test_document_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        let todo = store.insert_todo(new_todo("a@x.com", "keep")).await.unwrap();
        store.insert_user_if_absent("a@x.com").await.unwrap();
        store.set_pro_license("a@x.com").await.unwrap();
        drop(store);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["users"]["1"]["_pro_license"], serde_json::json!(true));
        assert_eq!(raw["todos"]["1"]["title"], serde_json::json!("keep"));

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.find_todo_by_id(todo.id).await.unwrap(), Some(todo));
        assert_eq!(
            reopened.find_user_by_email("a@x.com").await.unwrap(),
            Some(User {
                email: "a@x.com".into(),
                pro_license: true
            })
        );
    }

    #[tokio::test]
    async fn test_removed_id_is_not_reused_while_higher_ids_exist() {
        let store = JsonFileStore::in_memory();
        store.insert_todo(new_todo("a@x.com", "one")).await.unwrap();
        store.insert_todo(new_todo("a@x.com", "two")).await.unwrap();
        assert!(store.remove_todo(1).await.unwrap());

        let third = store.insert_todo(new_todo("a@x.com", "three")).await.unwrap();
        assert_eq!(third.id, 3);
        assert_eq!(store.find_todo_by_id(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_document_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        let kept = store.insert_todo(new_todo("a@x.com", "kept")).await.unwrap();
        store.insert_user_if_absent("a@x.com").await.unwrap();

        // A directory where the temp file goes makes every write fail
        std::fs::create_dir(dir.path().join("db.json.tmp")).unwrap();

        assert!(store.insert_todo(new_todo("a@x.com", "lost")).await.is_err());
        assert_eq!(store.find_todo_by_id(kept.id + 1).await.unwrap(), None);

        let patch = TodoPatch {
            title: Some("changed".into()),
            ..TodoPatch::default()
        };
        assert!(store.update_todo(kept.id, &patch).await.is_err());
        assert!(store.remove_todo(kept.id).await.is_err());
        assert_eq!(store.find_todo_by_id(kept.id).await.unwrap(), Some(kept.clone()));

        assert!(store.set_pro_license("a@x.com").await.is_err());
        assert!(store.insert_user_if_absent("b@x.com").await.is_err());
        assert!(!store.find_user_by_email("a@x.com").await.unwrap().unwrap().pro_license);
        assert_eq!(store.find_user_by_email("b@x.com").await.unwrap(), None);

        // Once writes succeed again, nothing from the failed calls reaches disk
        std::fs::remove_dir(dir.path().join("db.json.tmp")).unwrap();
        let next = store.insert_todo(new_todo("a@x.com", "next")).await.unwrap();
        assert_eq!(next.id, kept.id + 1);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let titles: Vec<_> = reopened
            .find_todos_by_email("a@x.com")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["kept", "next"]);
    }
}
