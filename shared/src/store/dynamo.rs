use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::operation::batch_write_item::BatchWriteItemOutput;
use aws_sdk_dynamodb::types::{
    AttributeValue, DeleteRequest, PutRequest, ReturnValue, WriteRequest,
};
use aws_sdk_dynamodb::Client as DynamoClient;

use super::{RecordStore, StoreError, StoreResult};
use crate::types::{NewTodo, Todo, TodoPatch, User};

type Item = HashMap<String, AttributeValue>;

const PROFILE_SK: &str = "PROFILE";
const COUNTER_PK: &str = "COUNTER";
const COUNTER_SK: &str = "TODO";
const MAX_BATCH_ATTEMPTS: u64 = 5;

fn user_pk(email: &str) -> String {
    format!("USER#{}", email)
}

/// Zero-padded so a `begins_with` query returns todos in id order.
fn todo_sk(id: u64) -> String {
    format!("TODO#{:020}", id)
}

fn pointer_pk(id: u64) -> String {
    format!("TODO#{}", id)
}

fn backend<E: std::fmt::Debug>(context: &str) -> impl Fn(E) -> StoreError + '_ {
    move |e| {
        tracing::error!("DynamoDB {} failed: {:?}", context, e);
        StoreError::Backend(format!("{} failed: {:?}", context, e))
    }
}

/// Requests for `table` that a batch write left undone, if any.
fn pending_writes(output: &BatchWriteItemOutput, table: &str) -> Option<Vec<WriteRequest>> {
    output
        .unprocessed_items()
        .and_then(|items| items.get(table))
        .filter(|requests| !requests.is_empty())
        .cloned()
}

fn string_attr(item: &Item, name: &str) -> String {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

fn todo_item(todo: &Todo) -> StoreResult<Item> {
    let mut item = HashMap::new();
    item.insert("PK".to_string(), AttributeValue::S(user_pk(&todo.email)));
    item.insert("SK".to_string(), AttributeValue::S(todo_sk(todo.id)));
    item.insert("id".to_string(), AttributeValue::N(todo.id.to_string()));
    item.insert("email".to_string(), AttributeValue::S(todo.email.clone()));
    item.insert("title".to_string(), AttributeValue::S(todo.title.clone()));
    item.insert(
        "description".to_string(),
        AttributeValue::S(todo.description.clone()),
    );
    item.insert("time".to_string(), AttributeValue::S(todo.time.clone()));
    item.insert(
        "images".to_string(),
        AttributeValue::S(serde_json::to_string(&todo.images)?),
    );
    Ok(item)
}

fn pointer_item(todo: &Todo) -> Item {
    let pk = pointer_pk(todo.id);
    let mut item = HashMap::new();
    item.insert("PK".to_string(), AttributeValue::S(pk.clone()));
    item.insert("SK".to_string(), AttributeValue::S(pk));
    item.insert("owner".to_string(), AttributeValue::S(todo.email.clone()));
    item
}

fn todo_from_item(item: &Item) -> StoreResult<Todo> {
    let id = item
        .get("id")
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| StoreError::Backend("todo item without numeric id".to_string()))?;
    let images = match item.get("images").and_then(|v| v.as_s().ok()) {
        Some(raw) => serde_json::from_str(raw)?,
        None => Vec::new(),
    };

    Ok(Todo {
        id,
        email: string_attr(item, "email"),
        title: string_attr(item, "title"),
        description: string_attr(item, "description"),
        time: string_attr(item, "time"),
        images,
    })
}

fn user_from_item(item: &Item) -> User {
    User {
        email: string_attr(item, "email"),
        pro_license: item
            .get("pro_license")
            .and_then(|v| v.as_bool().ok())
            .copied()
            .unwrap_or(false),
    }
}

/// Single-table DynamoDB store.
///
/// Users live at `USER#<email>`/`PROFILE`, todos under their owner's partition at
/// `USER#<email>`/`TODO#<padded id>`, and a pointer item `TODO#<id>`/`TODO#<id>` maps an id
/// back to its owner. Ids come from an atomic counter at `COUNTER`/`TODO`.
pub struct DynamoStore {
    client: DynamoClient,
    table_name: String,
}

impl DynamoStore {
    pub fn new(client: DynamoClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    async fn next_todo_id(&self) -> StoreResult<u64> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(COUNTER_PK.to_string()))
            .key("SK", AttributeValue::S(COUNTER_SK.to_string()))
            .update_expression("ADD seq :one")
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await
            .map_err(backend("counter update"))?;

        result
            .attributes()
            .and_then(|attrs| attrs.get("seq"))
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| StoreError::Backend("counter returned no sequence".to_string()))
    }

    async fn owner_of(&self, id: u64) -> StoreResult<Option<String>> {
        let pk = pointer_pk(id);
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(pk.clone()))
            .key("SK", AttributeValue::S(pk))
            .send()
            .await
            .map_err(backend("get_item"))?;

        Ok(result.item().map(|item| string_attr(item, "owner")))
    }

    /// Write every request, resubmitting whatever DynamoDB reports as unprocessed.
    /// Fails if requests are still pending after the last attempt.
    async fn write_batch(&self, requests: Vec<WriteRequest>) -> StoreResult<()> {
        let mut attempts = 0u64;
        let mut unprocessed = Some(requests);

        while let Some(requests) = unprocessed {
            attempts += 1;
            if attempts > MAX_BATCH_ATTEMPTS {
                tracing::error!(
                    "batch_write_item gave up with {} unprocessed request(s)",
                    requests.len()
                );
                return Err(StoreError::Backend(format!(
                    "{} write(s) left unprocessed",
                    requests.len()
                )));
            }

            let result = self
                .client
                .batch_write_item()
                .request_items(&self.table_name, requests)
                .send()
                .await
                .map_err(backend("batch_write_item"))?;

            unprocessed = pending_writes(&result, &self.table_name);
            if let Some(pending) = &unprocessed {
                tracing::warn!(
                    "Retrying {} unprocessed write(s) (attempt {})",
                    pending.len(),
                    attempts
                );
                tokio::time::sleep(Duration::from_millis(100 * attempts)).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for DynamoStore {
    async fn insert_todo(&self, todo: NewTodo) -> StoreResult<Todo> {
        let id = self.next_todo_id().await?;
        let todo = todo.with_id(id);

        let put = |item: Item| -> StoreResult<WriteRequest> {
            let request = PutRequest::builder()
                .set_item(Some(item))
                .build()
                .map_err(|e| StoreError::Backend(format!("invalid put request: {}", e)))?;
            Ok(WriteRequest::builder().put_request(request).build())
        };
        self.write_batch(vec![put(todo_item(&todo)?)?, put(pointer_item(&todo))?])
            .await?;

        tracing::info!("Stored todo {} for {}", todo.id, todo.email);
        Ok(todo)
    }

    async fn find_todo_by_id(&self, id: u64) -> StoreResult<Option<Todo>> {
        let Some(owner) = self.owner_of(id).await? else {
            return Ok(None);
        };

        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(user_pk(&owner)))
            .key("SK", AttributeValue::S(todo_sk(id)))
            .send()
            .await
            .map_err(backend("get_item"))?;

        result.item().map(todo_from_item).transpose()
    }

    async fn find_todos_by_email(&self, email: &str) -> StoreResult<Vec<Todo>> {
        let mut todos = Vec::new();
        let mut start_key: Option<Item> = None;
        loop {
            let result = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("PK = :pk AND begins_with(SK, :sk_prefix)")
                .expression_attribute_values(":pk", AttributeValue::S(user_pk(email)))
                .expression_attribute_values(":sk_prefix", AttributeValue::S("TODO#".to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(backend("query"))?;

            for item in result.items() {
                todos.push(todo_from_item(item)?);
            }

            match result.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(todos)
    }

    async fn update_todo(&self, id: u64, patch: &TodoPatch) -> StoreResult<Option<Todo>> {
        let Some(owner) = self.owner_of(id).await? else {
            return Ok(None);
        };
        if patch.is_empty() {
            return self.find_todo_by_id(id).await;
        }

        let mut update_expr = vec![];
        let mut expr_names = HashMap::new();
        let mut expr_values = HashMap::new();

        if let Some(title) = &patch.title {
            update_expr.push("title = :title");
            expr_values.insert(":title".to_string(), AttributeValue::S(title.clone()));
        }
        if let Some(description) = &patch.description {
            update_expr.push("description = :description");
            expr_values.insert(
                ":description".to_string(),
                AttributeValue::S(description.clone()),
            );
        }
        if let Some(time) = &patch.time {
            update_expr.push("#time = :time");
            expr_names.insert("#time".to_string(), "time".to_string());
            expr_values.insert(":time".to_string(), AttributeValue::S(time.clone()));
        }
        if let Some(images) = &patch.images {
            update_expr.push("images = :images");
            expr_values.insert(
                ":images".to_string(),
                AttributeValue::S(serde_json::to_string(images)?),
            );
        }

        let mut builder = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(user_pk(&owner)))
            .key("SK", AttributeValue::S(todo_sk(id)))
            .update_expression(format!("SET {}", update_expr.join(", ")))
            .condition_expression("attribute_exists(PK)")
            .return_values(ReturnValue::AllNew);

        for (k, v) in expr_names {
            builder = builder.expression_attribute_names(k, v);
        }
        for (k, v) in expr_values {
            builder = builder.expression_attribute_values(k, v);
        }

        match builder.send().await {
            Ok(result) => result.attributes().map(todo_from_item).transpose(),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Ok(None)
            }
            Err(e) => Err(backend("update_item")(e)),
        }
    }

    async fn remove_todo(&self, id: u64) -> StoreResult<bool> {
        let Some(owner) = self.owner_of(id).await? else {
            return Ok(false);
        };

        let delete = |pk: String, sk: String| -> StoreResult<WriteRequest> {
            let request = DeleteRequest::builder()
                .key("PK", AttributeValue::S(pk))
                .key("SK", AttributeValue::S(sk))
                .build()
                .map_err(|e| StoreError::Backend(format!("invalid delete request: {}", e)))?;
            Ok(WriteRequest::builder().delete_request(request).build())
        };
        self.write_batch(vec![
            delete(user_pk(&owner), todo_sk(id))?,
            delete(pointer_pk(id), pointer_pk(id))?,
        ])
        .await?;

        tracing::info!("Removed todo {} owned by {}", id, owner);
        Ok(true)
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(user_pk(email)))
            .key("SK", AttributeValue::S(PROFILE_SK.to_string()))
            .send()
            .await
            .map_err(backend("get_item"))?;

        Ok(result.item().map(user_from_item))
    }

    async fn insert_user_if_absent(&self, email: &str) -> StoreResult<(User, bool)> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item("PK", AttributeValue::S(user_pk(email)))
            .item("SK", AttributeValue::S(PROFILE_SK.to_string()))
            .item("email", AttributeValue::S(email.to_string()))
            .item("pro_license", AttributeValue::Bool(false))
            .item(
                "created_at",
                AttributeValue::S(chrono::Utc::now().to_rfc3339()),
            )
            .condition_expression("attribute_not_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok((
                User {
                    email: email.to_string(),
                    pro_license: false,
                },
                true,
            )),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                let existing = self.find_user_by_email(email).await?.ok_or_else(|| {
                    StoreError::Backend(format!("user {} vanished after conflict", email))
                })?;
                Ok((existing, false))
            }
            Err(e) => Err(backend("put_item")(e)),
        }
    }

    async fn set_pro_license(&self, email: &str) -> StoreResult<usize> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(user_pk(email)))
            .key("SK", AttributeValue::S(PROFILE_SK.to_string()))
            .update_expression("SET pro_license = :pro")
            .expression_attribute_values(":pro", AttributeValue::Bool(true))
            .condition_expression("attribute_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(1),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Ok(0)
            }
            Err(e) => Err(backend("update_item")(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Todo {
        Todo {
            id: 12,
            email: "a@x.com".into(),
            title: "T".into(),
            description: "D".into(),
            time: "2024-01-01T10:00:00".into(),
            images: vec!["static/uploads/b.png".into(), "static/uploads/a.png".into()],
        }
    }

    #[test]
    fn test_keys_sort_by_id() {
        assert_eq!(user_pk("a@x.com"), "USER#a@x.com");
        assert_eq!(pointer_pk(12), "TODO#12");
        assert!(todo_sk(9) < todo_sk(10));
        assert_eq!(todo_sk(12), "TODO#00000000000000000012");
    }

    #[test]
    fn test_todo_item_keeps_image_order() {
        let todo = sample();
        let item = todo_item(&todo).unwrap();
        assert_eq!(item["PK"], AttributeValue::S("USER#a@x.com".into()));
        assert_eq!(todo_from_item(&item).unwrap(), todo);
    }

    #[test]
    fn test_pointer_item_names_owner() {
        let item = pointer_item(&sample());
        assert_eq!(item["PK"], item["SK"]);
        assert_eq!(string_attr(&item, "owner"), "a@x.com");
    }

    #[test]
    fn test_item_without_id_is_rejected() {
        let mut item = todo_item(&sample()).unwrap();
        item.remove("id");
        assert!(matches!(todo_from_item(&item), Err(StoreError::Backend(_))));
    }

    #[test]
    fn test_unprocessed_writes_are_resubmitted() {
        let pointer = PutRequest::builder()
            .set_item(Some(pointer_item(&sample())))
            .build()
            .unwrap();
        let request = WriteRequest::builder().put_request(pointer).build();

        let partial = BatchWriteItemOutput::builder()
            .unprocessed_items("protodo", vec![request.clone()])
            .build();
        assert_eq!(pending_writes(&partial, "protodo"), Some(vec![request]));

        let done = BatchWriteItemOutput::builder()
            .set_unprocessed_items(Some(HashMap::new()))
            .build();
        assert_eq!(pending_writes(&done, "protodo"), None);
        assert_eq!(pending_writes(&BatchWriteItemOutput::builder().build(), "protodo"), None);
    }

    #[test]
    fn test_user_flag_defaults_to_false() {
        let mut item = HashMap::new();
        item.insert("email".to_string(), AttributeValue::S("a@x.com".into()));
        assert_eq!(
            user_from_item(&item),
            User {
                email: "a@x.com".into(),
                pro_license: false
            }
        );
    }
}
