//! Query surface: named operations with JSON variables, answered in a GraphQL-shaped
//! envelope (`{"data": ..}` or `{"errors": [{"message": ..}]}`).

use lambda_http::{http::StatusCode, Body, Error, Request, Response};
use protodo_shared::session::Session;
use protodo_shared::store::StoreError;
use protodo_shared::todos::TodoError;
use protodo_shared::types::{
    AddUserRequest, CreateTodoRequest, TodoPatch, UpdateTodoRequest, User,
};
use protodo_shared::AppState;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::http_handler::json_response;

#[derive(Deserialize, Debug)]
#[serde(tag = "operation", content = "variables", rename_all = "camelCase")]
pub(crate) enum Operation {
    Todos { email: String },
    User { email: String },
    AddTodo(CreateTodoRequest),
    UpdateTodo(UpdateTodoRequest),
    DeleteTodo { id: u64 },
    AddUser(AddUserRequest),
    ActivateProLicense { email: String },
}

fn user_json(user: &User) -> Value {
    json!({ "email": user.email, "proLicense": user.pro_license })
}

const INTERNAL_ERROR: &str = "Internal server error";

/// Client-facing message; backend and I/O details stay in the logs.
fn todo_message(error: TodoError) -> String {
    match error {
        TodoError::Store(_) | TodoError::Image(_) => {
            tracing::error!("Query operation failed: {}", error);
            INTERNAL_ERROR.to_string()
        }
        other => other.to_string(),
    }
}

fn store_message(error: StoreError) -> String {
    tracing::error!("Query operation failed: {}", error);
    INTERNAL_ERROR.to_string()
}

fn same_user(session: &Session, email: &str) -> Result<(), String> {
    if session.email == email {
        Ok(())
    } else {
        tracing::warn!("{} queried data of {}", session.email, email);
        Err("Forbidden".to_string())
    }
}

/// Run one operation as the session's user.
pub(crate) async fn execute(
    state: &AppState,
    session: &Session,
    operation: Operation,
) -> Result<Value, String> {
    match operation {
        Operation::Todos { email } => {
            same_user(session, &email)?;
            let todos = state.todos.list(&email).await.map_err(todo_message)?;
            Ok(json!({ "todos": todos }))
        }
        Operation::User { email } => {
            same_user(session, &email)?;
            let user = state.users.get(&email).await.map_err(store_message)?;
            Ok(json!({ "user": user.as_ref().map(user_json) }))
        }
        Operation::AddTodo(request) => {
            same_user(session, &request.email)?;
            let todo = state
                .todos
                .create(
                    &request.email,
                    &request.title,
                    &request.description,
                    &request.time,
                    request.images,
                )
                .await
                .map_err(todo_message)?;
            Ok(json!({ "addTodo": { "todo": todo } }))
        }
        Operation::UpdateTodo(request) => {
            let patch = TodoPatch {
                title: request.title,
                description: request.description,
                time: request.time,
                images: request.images,
            };
            let todo = state
                .todos
                .update(&session.email, request.id, patch)
                .await
                .map_err(todo_message)?;
            Ok(json!({ "updateTodo": { "todo": todo } }))
        }
        Operation::DeleteTodo { id } => {
            state
                .todos
                .delete(&session.email, id)
                .await
                .map_err(todo_message)?;
            Ok(json!({ "deleteTodo": { "success": true } }))
        }
        Operation::AddUser(request) => {
            same_user(session, &request.email)?;
            let user = state
                .users
                .ensure(&request.email)
                .await
                .map_err(store_message)?;
            Ok(json!({ "addUser": { "user": user_json(&user) } }))
        }
        Operation::ActivateProLicense { email } => {
            same_user(session, &email)?;
            let success = state.license.activate(&email).await;
            Ok(json!({ "activateProLicense": { "success": success } }))
        }
    }
}

fn errors(status: StatusCode, message: &str) -> Result<Response<Body>, Error> {
    json_response(status, json!({ "errors": [{ "message": message }] }))
}

pub(crate) async fn handle(
    event: &Request,
    state: &AppState,
    session: Option<&Session>,
) -> Result<Response<Body>, Error> {
    let Some(session) = session else {
        return errors(StatusCode::UNAUTHORIZED, "Not authenticated");
    };

    let operation: Operation = match serde_json::from_slice(event.body()) {
        Ok(operation) => operation,
        Err(e) => {
            tracing::info!("Rejected query body: {}", e);
            return errors(StatusCode::BAD_REQUEST, &format!("Invalid operation: {}", e));
        }
    };
    tracing::info!("Query operation {:?} from {}", operation, session.email);

    match execute(state, session, operation).await {
        Ok(data) => json_response(StatusCode::OK, json!({ "data": data })),
        Err(message) => errors(StatusCode::OK, &message),
    }
}
