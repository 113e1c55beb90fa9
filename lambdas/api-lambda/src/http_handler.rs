use lambda_http::{
    http::{header::LOCATION, header::SET_COOKIE, Method, StatusCode},
    Body, Error, Request, RequestPayloadExt, Response,
};
use protodo_shared::auth::{LoginError, LoginRequest};
use protodo_shared::session::{self, Session, SessionError};
use protodo_shared::todos::{normalize_time, TodoError};
use protodo_shared::types::{ImageUpload, TodoPatch};
use protodo_shared::AppState;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

use crate::graphql;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
enum TodoAction {
    Add,
    Update,
    Delete,
}

#[derive(Deserialize)]
struct TodoForm {
    action: TodoAction,
    todo_id: Option<u64>,
    title: Option<String>,
    description: Option<String>,
    time: Option<String>,
    #[serde(default)]
    images: Vec<ImageUpload>,
}

#[derive(Deserialize)]
struct UploadForm {
    #[serde(default)]
    images: Vec<ImageUpload>,
}

/// Main Lambda handler - routes form and query requests
pub(crate) async fn function_handler(
    event: Request,
    state: Arc<AppState>,
) -> Result<Response<Body>, Error> {
    let method = event.method().clone();
    let path = event.uri().path().to_string();
    tracing::info!("ProTodo API invoked - Method: {} Path: {}", method, path);

    // Handle CORS preflight
    if method == Method::OPTIONS {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET,POST,OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type,Cookie")
            .body(Body::Empty)
            .map_err(Box::new)?);
    }

    // Public routes
    match (&method, path.as_str()) {
        (&Method::GET, "/") => return text(StatusCode::OK, "Welcome to ProTodo."),
        (&Method::GET, "/pro_license") => {
            return text(
                StatusCode::OK,
                "Upgrade to a Pro License to attach images to your todos.",
            )
        }
        (&Method::GET, "/payment-failure") => {
            return text(StatusCode::OK, "Payment Failed. Please try again.")
        }
        (&Method::GET, "/login") => return login_page(&state),
        (&Method::POST, "/login") => return login(&event, &state).await,
        (&Method::GET, "/logout") => return logout(),
        _ => {}
    }

    // Everything below needs a verified session
    let session = current_session(&event, &state);

    match (&method, path.as_str()) {
        (&Method::POST, "/graphql") => graphql::handle(&event, &state, session.as_ref()).await,
        (&Method::GET, "/todo") => match session {
            Some(session) => list_todos(&state, &session).await,
            None => redirect("/login"),
        },
        (&Method::POST, "/todo") => match session {
            Some(session) => submit_todo(&event, &state, &session).await,
            None => redirect("/login"),
        },
        (&Method::POST, "/upload") => match session {
            Some(session) => upload(&event, &state, &session).await,
            None => redirect("/login"),
        },
        (&Method::GET, "/payment-success") => match session {
            Some(session) => payment_success(&state, &session).await,
            None => redirect("/login"),
        },
        (&Method::POST, "/activate_pro") => match session {
            Some(session) => {
                state.license.activate(&session.email).await;
                redirect("/todo")
            }
            None => redirect("/login"),
        },
        (&Method::POST, "/refresh") => match session {
            Some(session) => refresh(&state, &session).await,
            None => redirect("/login"),
        },
        (_, "/" | "/pro_license" | "/payment-failure" | "/login" | "/logout" | "/graphql"
        | "/todo" | "/upload" | "/payment-success" | "/activate_pro" | "/refresh") => {
            method_not_allowed()
        }
        _ => not_found(),
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn current_session(event: &Request, state: &AppState) -> Option<Session> {
    match session::authenticate(
        event.headers(),
        state.settings.session_secret.as_deref(),
        now(),
    ) {
        Ok(session) => Some(session),
        Err(SessionError::Missing) => None,
        Err(e) => {
            tracing::warn!("Rejected session cookie: {}", e);
            None
        }
    }
}

/// Decode a JSON or urlencoded body; `None` when it is absent or does not fit `T`.
fn form<T: DeserializeOwned>(event: &Request) -> Option<T> {
    match event.payload::<T>() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Failed to parse request body: {}", e);
            None
        }
    }
}

// ========== FORM SURFACE ==========

fn login_page(state: &AppState) -> Result<Response<Body>, Error> {
    if !state.login_enabled() {
        return text(StatusCode::SERVICE_UNAVAILABLE, "Login is not configured.");
    }
    text(StatusCode::OK, "POST email and password to /login.")
}

async fn login(event: &Request, state: &AppState) -> Result<Response<Body>, Error> {
    let secret = match state.settings.session_secret.as_deref() {
        Some(secret) if state.login_enabled() => secret,
        _ => return text(StatusCode::SERVICE_UNAVAILABLE, "Login is not configured."),
    };

    let Some(request) = form::<LoginRequest>(event) else {
        return text(StatusCode::BAD_REQUEST, "Failed to login");
    };

    let tokens = match state.auth.login(&request.email, &request.password).await {
        Ok(tokens) => tokens,
        Err(LoginError::Rejected(reason) | LoginError::Upstream(reason)) => {
            tracing::info!("Login failed for {}: {}", request.email, reason);
            return text(StatusCode::BAD_REQUEST, "Failed to login");
        }
        Err(LoginError::NotConfigured) => {
            return text(StatusCode::SERVICE_UNAVAILABLE, "Login is not configured.")
        }
        Err(LoginError::Store(e)) => {
            tracing::error!("Failed to record user {}: {}", request.email, e);
            return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to login");
        }
    };

    let ttl = state.settings.session_ttl_secs;
    let session = Session::new(&request.email, tokens, now(), ttl);
    let cookie = session::set_cookie(&session::encode(&session, secret)?, ttl);
    let location = state.settings.redirect_uri.as_deref().unwrap_or("/");

    redirect_with_cookie(location, &cookie)
}

fn logout() -> Result<Response<Body>, Error> {
    redirect_with_cookie("/", &session::clear_cookie())
}

async fn refresh(state: &AppState, current: &Session) -> Result<Response<Body>, Error> {
    let Some(secret) = state.settings.session_secret.as_deref() else {
        return text(StatusCode::SERVICE_UNAVAILABLE, "Login is not configured.");
    };

    let tokens = match state
        .auth
        .refresh(&current.email, &current.refresh_token)
        .await
    {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::info!("Token refresh failed for {}: {}", current.email, e);
            return text(StatusCode::UNAUTHORIZED, "Failed to refresh session");
        }
    };

    let ttl = state.settings.session_ttl_secs;
    let session = current.refreshed(tokens, now(), ttl);
    let cookie = session::set_cookie(&session::encode(&session, secret)?, ttl);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header(SET_COOKIE, cookie)
        .body(
            serde_json::json!({ "email": session.email, "expires_at": session.expires_at })
                .to_string()
                .into(),
        )
        .map_err(Box::new)?)
}

async fn list_todos(state: &AppState, session: &Session) -> Result<Response<Body>, Error> {
    let todos = match state.todos.list(&session.email).await {
        Ok(todos) => todos,
        Err(e) => return todo_error(e),
    };
    let pro_user = state.license.is_pro(&session.email).await;

    json_response(
        StatusCode::OK,
        serde_json::json!({ "todos": todos, "pro_user": pro_user }),
    )
}

async fn submit_todo(
    event: &Request,
    state: &AppState,
    session: &Session,
) -> Result<Response<Body>, Error> {
    let Some(request) = form::<TodoForm>(event) else {
        return text(StatusCode::BAD_REQUEST, "Missing or invalid action");
    };
    let email = session.email.as_str();

    let result = match request.action {
        TodoAction::Add => {
            let (Some(title), Some(description), Some(time)) =
                (&request.title, &request.description, &request.time)
            else {
                return text(StatusCode::BAD_REQUEST, "title, description and time are required");
            };
            // Validate before any upload touches storage
            if let Err(e) = normalize_time(time) {
                return todo_error(e);
            }
            match state.todos.store_uploads(email, &request.images).await {
                Ok(paths) => state
                    .todos
                    .create(email, title, description, time, paths)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            }
        }
        TodoAction::Update => {
            let (Some(id), Some(title), Some(description), Some(time)) = (
                request.todo_id,
                request.title.clone(),
                request.description.clone(),
                request.time.clone(),
            ) else {
                return text(
                    StatusCode::BAD_REQUEST,
                    "todo_id, title, description and time are required",
                );
            };
            // The page submits every field; the image list is replaced by this upload
            let patch = TodoPatch {
                title: Some(title),
                description: Some(description),
                time: Some(time),
                images: None,
            };
            state
                .todos
                .update_with_uploads(email, id, patch, &request.images)
                .await
                .map(|_| ())
        }
        TodoAction::Delete => {
            let Some(id) = request.todo_id else {
                return text(StatusCode::BAD_REQUEST, "todo_id is required");
            };
            state.todos.delete(email, id).await
        }
    };

    match result {
        Ok(()) => redirect("/todo"),
        Err(e) => todo_error(e),
    }
}

async fn upload(
    event: &Request,
    state: &AppState,
    session: &Session,
) -> Result<Response<Body>, Error> {
    if !state.license.is_pro(&session.email).await {
        return redirect("/pro_license");
    }

    let images = form::<UploadForm>(event)
        .map(|f| f.images)
        .unwrap_or_default();
    if images.is_empty() {
        return text(StatusCode::BAD_REQUEST, "No images provided");
    }

    match state.todos.store_uploads(&session.email, &images).await {
        Ok(paths) => {
            tracing::info!("Stored {} upload(s) for {}", paths.len(), session.email);
            redirect("/")
        }
        Err(e) => todo_error(e),
    }
}

async fn payment_success(state: &AppState, session: &Session) -> Result<Response<Body>, Error> {
    if state.license.activate(&session.email).await {
        text(StatusCode::OK, "Payment successful. Your Pro License is active.")
    } else {
        text(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error activating Pro License.",
        )
    }
}

// ========== RESPONSES ==========

fn todo_error(error: TodoError) -> Result<Response<Body>, Error> {
    match error {
        TodoError::InvalidTime(_) => text(StatusCode::BAD_REQUEST, "Invalid date format"),
        TodoError::NotFound(_) => text(StatusCode::NOT_FOUND, "Todo not found"),
        TodoError::Forbidden(_) => text(StatusCode::FORBIDDEN, "Forbidden"),
        TodoError::Store(e) => {
            tracing::error!("Store failure: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
        TodoError::Image(e) => {
            tracing::error!("Image upload failure: {}", e);
            text(StatusCode::BAD_REQUEST, "Failed to store image")
        }
    }
}

pub(crate) fn text(status: StatusCode, body: &str) -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("Access-Control-Allow-Origin", "*")
        .body(body.to_string().into())
        .map_err(Box::new)?)
}

pub(crate) fn json_response(
    status: StatusCode,
    body: serde_json::Value,
) -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(body.to_string().into())
        .map_err(Box::new)?)
}

fn redirect(location: &str) -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .body(Body::Empty)
        .map_err(Box::new)?)
}

fn redirect_with_cookie(location: &str, cookie: &str) -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .header(SET_COOKIE, cookie)
        .body(Body::Empty)
        .map_err(Box::new)?)
}

fn method_not_allowed() -> Result<Response<Body>, Error> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        serde_json::json!({"error": "Method not allowed"}),
    )
}

fn not_found() -> Result<Response<Body>, Error> {
    json_response(
        StatusCode::NOT_FOUND,
        serde_json::json!({"error": "Not found"}),
    )
}
