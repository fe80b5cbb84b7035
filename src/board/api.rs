use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Deserializer};
use tokio::sync::broadcast;
use tracing::{error, warn};

use super::db::{DbHandle, NewTask};
use super::models::*;
use super::ws::{WsMessage, broadcast_message};
use crate::errors::{BoardError, SlugError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateClientRequest {
    pub name: String,
    pub project_key: Option<String>,
}

#[derive(Deserialize)]
pub struct SetKeyRequest {
    pub project_key: String,
}

#[derive(Deserialize)]
pub struct SuggestKeyQuery {
    pub name: String,
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct CreateSprintRequest {
    pub name: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub sprint_id: Option<i64>,
    pub due_date: Option<String>,
}

/// `sprint_id` and `due_date` distinguish "absent" from an explicit `null`,
/// which clears the field.
#[derive(Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub sprint_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub due_date: Option<Option<String>>,
}

#[derive(Deserialize)]
pub struct AllocateRequest {
    pub kind: String,
    pub entity_id: i64,
}

#[derive(Deserialize)]
pub struct ResolveQuery {
    pub kind: Option<String>,
}

fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<BoardError> for ApiError {
    fn from(err: BoardError) -> Self {
        let msg = err.to_string();
        match err {
            BoardError::ClientNotFound { .. }
            | BoardError::ProjectNotFound { .. }
            | BoardError::SprintNotFound { .. }
            | BoardError::TaskNotFound { .. }
            | BoardError::Slug(SlugError::NotFound { .. }) => ApiError::NotFound(msg),
            BoardError::BadRequest(_) | BoardError::Slug(SlugError::InvalidKey(_)) => {
                ApiError::BadRequest(msg)
            }
            BoardError::KeyTaken { .. } => ApiError::Conflict(msg),
            BoardError::Slug(SlugError::ContentionExceeded { .. }) => {
                warn!(error = %msg, "slug allocation gave up");
                ApiError::Unavailable(msg)
            }
            BoardError::Slug(SlugError::Store(_)) | BoardError::Other(_) => {
                error!(error = ?err, "request failed");
                ApiError::Internal(msg)
            }
        }
    }
}

fn parse_field<T: FromStr<Err = String>>(raw: Option<&str>) -> Result<Option<T>, ApiError> {
    raw.map(T::from_str).transpose().map_err(ApiError::BadRequest)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/clients", get(list_clients).post(create_client))
        .route("/api/clients/suggest-key", get(suggest_key))
        .route("/api/clients/{id}", get(get_client).delete(delete_client))
        .route("/api/clients/{id}/key", put(set_client_key))
        .route(
            "/api/clients/{id}/projects",
            get(list_projects).post(create_project),
        )
        .route(
            "/api/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/projects/{id}/board", get(get_board))
        .route("/api/projects/{id}/sprints", post(create_sprint))
        .route("/api/projects/{id}/tasks", post(create_task))
        .route(
            "/api/sprints/{id}",
            get(get_sprint).patch(update_sprint).delete(delete_sprint),
        )
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/slugs/allocate", post(allocate_slug))
        .route("/api/slugs/backfill", post(backfill_slugs))
        .route("/api/slugs/{slug}", get(resolve_slug))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_clients(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let clients = state.db.call(move |db| Ok(db.list_clients()?)).await?;
    Ok(Json(clients))
}

async fn create_client(
    State(state): State<SharedState>,
    Json(req): Json<CreateClientRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let client = state
        .db
        .call(move |db| db.create_client(&req.name, req.project_key.as_deref()))
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::ClientCreated { client: client.clone() });
    Ok((StatusCode::CREATED, Json(client)))
}

async fn suggest_key(
    State(state): State<SharedState>,
    Query(query): Query<SuggestKeyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let key = state
        .db
        .call(move |db| Ok(db.suggest_available_key(&query.name)?))
        .await?;
    Ok(Json(serde_json::json!({ "key": key })))
}

async fn get_client(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.db.call(move |db| db.get_client_detail(id)).await?;
    Ok(Json(detail))
}

async fn delete_client(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.db.call(move |db| db.delete_client(id)).await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ClientDeleted {
            client_id: id,
            removed: removed.clone(),
        },
    );
    Ok(Json(removed))
}

async fn set_client_key(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<SetKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let client = state
        .db
        .call(move |db| db.set_client_key(id, &req.project_key))
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::ClientKeyChanged { client: client.clone() });
    Ok(Json(client))
}

async fn list_projects(
    State(state): State<SharedState>,
    Path(client_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let projects = state
        .db
        .call(move |db| {
            db.get_client(client_id)?
                .ok_or(BoardError::ClientNotFound { id: client_id })?;
            Ok(db.list_projects(client_id)?)
        })
        .await?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    Path(client_id): Path<i64>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let description = req.description.unwrap_or_default();
    let project = state
        .db
        .call(move |db| db.create_project(client_id, &req.name, &description))
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::ProjectCreated { project: project.clone() });
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.db.call(move |db| Ok(db.get_project(id)?)).await?;
    match project {
        Some(project) => Ok(Json(project)),
        None => Err(ApiError::NotFound(format!("Project {} not found", id))),
    }
}

async fn update_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = ProjectStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let project = state
        .db
        .call(move |db| db.update_project_status(id, status))
        .await?;
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.db.call(move |db| db.delete_project(id)).await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ProjectDeleted {
            project_id: id,
            removed: removed.clone(),
        },
    );
    Ok(Json(removed))
}

async fn get_board(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let board = state.db.call(move |db| db.get_project_board(id)).await?;
    Ok(Json(board))
}

async fn create_sprint(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateSprintRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sprint = state
        .db
        .call(move |db| {
            db.create_sprint(
                project_id,
                &req.name,
                req.start_date.as_deref(),
                req.end_date.as_deref(),
            )
        })
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::SprintCreated { sprint: sprint.clone() });
    Ok((StatusCode::CREATED, Json(sprint)))
}

async fn get_sprint(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let sprint = state.db.call(move |db| Ok(db.get_sprint(id)?)).await?;
    match sprint {
        Some(sprint) => Ok(Json(sprint)),
        None => Err(ApiError::NotFound(format!("Sprint {} not found", id))),
    }
}

async fn update_sprint(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = SprintStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let sprint = state
        .db
        .call(move |db| db.update_sprint_status(id, status))
        .await?;
    Ok(Json(sprint))
}

async fn delete_sprint(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| Ok(db.delete_sprint(id)?)).await?;
    match deleted {
        true => {
            broadcast_message(&state.ws_tx, &WsMessage::SprintDeleted { sprint_id: id });
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(ApiError::NotFound(format!("Sprint {} not found", id))),
    }
}

async fn create_task(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let priority = parse_field::<Priority>(req.priority.as_deref())?;
    let new = NewTask {
        title: req.title,
        description: req.description.unwrap_or_default(),
        priority,
        sprint_id: req.sprint_id,
        due_date: req.due_date,
    };
    let task = state.db.call(move |db| db.create_task(project_id, new)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::TaskCreated { task: task.clone() });
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.db.call(move |db| Ok(db.get_task(id)?)).await?;
    match task {
        Some(task) => Ok(Json(task)),
        None => Err(ApiError::NotFound(format!("Task {} not found", id))),
    }
}

async fn update_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let update = TaskUpdate {
        title: req.title,
        description: req.description,
        status: parse_field::<TaskStatus>(req.status.as_deref())?,
        priority: parse_field::<Priority>(req.priority.as_deref())?,
        sprint_id: req.sprint_id,
        due_date: req.due_date,
    };
    let task = state.db.call(move |db| db.update_task(id, update)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::TaskUpdated { task: task.clone() });
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| Ok(db.delete_task(id)?)).await?;
    match deleted {
        true => {
            broadcast_message(&state.ws_tx, &WsMessage::TaskDeleted { task_id: id });
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(ApiError::NotFound(format!("Task {} not found", id))),
    }
}

async fn allocate_slug(
    State(state): State<SharedState>,
    Json(req): Json<AllocateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = EntityKind::from_str(&req.kind).map_err(ApiError::BadRequest)?;
    let entity_id = req.entity_id;
    let slug = state
        .db
        .call(move |db| db.allocate_slug(kind, entity_id))
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::SlugAssigned {
            kind,
            entity_id,
            slug: slug.slug.clone(),
        },
    );
    Ok(Json(slug))
}

async fn resolve_slug(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
    Query(query): Query<ResolveQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let hint = parse_field::<EntityKind>(query.kind.as_deref())?;
    let lookup = slug.clone();
    let target = state
        .db
        .call(move |db| Ok(db.resolve_slug(&lookup, hint)?))
        .await?;
    match target {
        Some(target) => Ok(Json(target)),
        None => Err(ApiError::NotFound(format!("No entity with slug {}", slug))),
    }
}

async fn backfill_slugs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.db.call(move |db| Ok(db.backfill_slugs()?)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::BackfillCompleted { report: report.clone() });
    Ok(Json(report))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::db::AgencyDb;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn test_app() -> Router {
        let db = AgencyDb::new_in_memory().unwrap();
        let (ws_tx, _) = broadcast::channel(16);
        let state = Arc::new(AppState {
            db: DbHandle::new(db),
            ws_tx,
        });
        api_router().with_state(state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Client ACME with one project; returns the project id.
    async fn seed_project(app: &Router) -> i64 {
        let (status, client) = send(
            app,
            "POST",
            "/api/clients",
            Some(json!({"name": "Acme Corp", "project_key": "acme"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let client_id = client["id"].as_i64().unwrap();

        let (status, project) = send(
            app,
            "POST",
            &format!("/api/clients/{client_id}/projects"),
            Some(json!({"name": "Website"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        project["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_list_clients_empty() {
        let app = test_app();
        let request = Request::builder()
            .uri("/api/clients")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let clients: Vec<Value> = body_json(response.into_body()).await;
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn test_create_client_normalizes_key() {
        let app = test_app();
        let (status, client) = send(
            &app,
            "POST",
            "/api/clients",
            Some(json!({"name": "Acme Corp", "project_key": " acme "})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(client["project_key"], "ACME");

        let (status, detail) = send(&app, "GET", &format!("/api/clients/{}", client["id"]), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["name"], "Acme Corp");
        assert_eq!(detail["counters"][0]["key"], "ACME");
        assert_eq!(detail["counters"][0]["last_task_number"], 0);
    }

    #[tokio::test]
    async fn test_invalid_key_is_bad_request() {
        let app = test_app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/clients",
            Some(json!({"name": "Acme", "project_key": "A"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Invalid project key"));
    }

    #[tokio::test]
    async fn test_key_owned_by_other_client_is_conflict() {
        let app = test_app();
        send(&app, "POST", "/api/clients", Some(json!({"name": "Acme", "project_key": "ACME"}))).await;
        let (_, other) = send(&app, "POST", "/api/clients", Some(json!({"name": "Other"}))).await;
        assert!(other["project_key"].is_null());

        let (status, body) = send(
            &app,
            "PUT",
            &format!("/api/clients/{}/key", other["id"]),
            Some(json!({"project_key": "acme"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("ACME"));
    }

    #[tokio::test]
    async fn test_suggest_key() {
        let app = test_app();
        let (status, body) = send(&app, "GET", "/api/clients/suggest-key?name=Globex%20Industries", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key"], "GI");
    }

    #[tokio::test]
    async fn test_missing_client_is_not_found() {
        let app = test_app();
        let (status, body) = send(&app, "GET", "/api/clients/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Client 42 not found");

        let (status, _) = send(
            &app,
            "POST",
            "/api/clients/42/projects",
            Some(json!({"name": "Orphan"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_created_entities_carry_slugs() {
        let app = test_app();
        let project_id = seed_project(&app).await;

        let (_, project) = send(&app, "GET", &format!("/api/projects/{project_id}"), None).await;
        assert_eq!(project["slug"], "ACME-P-1");

        let (status, sprint) = send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/sprints"),
            Some(json!({"name": "Sprint 1", "start_date": "2024-03-01", "end_date": "2024-03-14"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sprint["slug"], "ACME-S-1");

        let (status, task) = send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/tasks"),
            Some(json!({"title": "Homepage", "priority": "high", "sprint_id": sprint["id"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["slug"], "ACME-1");
        assert_eq!(task["slug_number"], 1);
        assert_eq!(task["priority"], "high");
    }

    #[tokio::test]
    async fn test_blank_names_are_rejected_without_using_numbers() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let (_, project) = send(&app, "GET", &format!("/api/projects/{project_id}"), None).await;
        let client_id = project["client_id"].as_i64().unwrap();

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/clients/{client_id}/projects"),
            Some(json!({"name": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Project name"));

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/sprints"),
            Some(json!({"name": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Sprint name"));

        let (_, project) = send(
            &app,
            "POST",
            &format!("/api/clients/{client_id}/projects"),
            Some(json!({"name": "Mobile"})),
        )
        .await;
        assert_eq!(project["slug"], "ACME-P-2");
        let (_, sprint) = send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/sprints"),
            Some(json!({"name": "Sprint 1"})),
        )
        .await;
        assert_eq!(sprint["slug"], "ACME-S-1");
    }

    #[tokio::test]
    async fn test_create_task_rejects_bad_priority() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/tasks"),
            Some(json!({"title": "X", "priority": "critical"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Invalid priority"));
    }

    #[tokio::test]
    async fn test_resolve_slug_endpoint() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/tasks"),
            Some(json!({"title": "Homepage"})),
        )
        .await;

        let (status, body) = send(&app, "GET", "/api/slugs/acme-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "task");
        assert_eq!(body["entity"]["title"], "Homepage");

        let (status, body) = send(&app, "GET", "/api/slugs/ACME-P-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "project");

        let (status, _) = send(&app, "GET", "/api/slugs/UNKNOWN-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/api/slugs/ACME-1?kind=epic", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_allocate_endpoint_is_idempotent() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let (_, task) = send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/tasks"),
            Some(json!({"title": "Homepage"})),
        )
        .await;

        let (status, slug) = send(
            &app,
            "POST",
            "/api/slugs/allocate",
            Some(json!({"kind": "task", "entity_id": task["id"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(slug, json!({"slug": "ACME-1", "key": "ACME", "number": 1}));

        let (status, _) = send(
            &app,
            "POST",
            "/api/slugs/allocate",
            Some(json!({"kind": "task", "entity_id": 999})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_backfill_after_key_assignment() {
        let app = test_app();
        let (_, client) = send(&app, "POST", "/api/clients", Some(json!({"name": "Globex"}))).await;
        let client_id = client["id"].as_i64().unwrap();
        let (_, project) = send(
            &app,
            "POST",
            &format!("/api/clients/{client_id}/projects"),
            Some(json!({"name": "Rebrand"})),
        )
        .await;
        assert!(project["slug"].is_null());

        send(
            &app,
            "PUT",
            &format!("/api/clients/{client_id}/key"),
            Some(json!({"project_key": "GLOB"})),
        )
        .await;
        let (status, report) = send(&app, "POST", "/api/slugs/backfill", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["scanned"], 1);
        assert_eq!(report["assigned"], json!(["GLOB-P-1"]));
        assert_eq!(report["failed"], json!([]));
    }

    #[tokio::test]
    async fn test_update_task_clears_sprint_with_null() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let (_, sprint) = send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/sprints"),
            Some(json!({"name": "S1"})),
        )
        .await;
        let (_, task) = send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/tasks"),
            Some(json!({"title": "A", "sprint_id": sprint["id"]})),
        )
        .await;

        let uri = format!("/api/tasks/{}", task["id"]);
        let (status, updated) = send(&app, "PATCH", &uri, Some(json!({"status": "in_progress"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["status"], "in_progress");
        assert_eq!(updated["sprint_id"], sprint["id"]);

        let (_, updated) = send(&app, "PATCH", &uri, Some(json!({"sprint_id": null}))).await;
        assert!(updated["sprint_id"].is_null());

        let (status, _) = send(&app, "PATCH", &uri, Some(json!({"status": "blocked"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_board_groups_tasks() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        for title in ["A", "B"] {
            send(
                &app,
                "POST",
                &format!("/api/projects/{project_id}/tasks"),
                Some(json!({"title": title})),
            )
            .await;
        }
        let (status, board) = send(&app, "GET", &format!("/api/projects/{project_id}/board"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(board["project"]["id"], project_id);
        assert_eq!(board["columns"][0]["status"], "todo");
        assert_eq!(board["columns"][0]["tasks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_endpoints() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let (_, sprint) = send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/sprints"),
            Some(json!({"name": "S1"})),
        )
        .await;
        let (_, task) = send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/tasks"),
            Some(json!({"title": "A"})),
        )
        .await;

        let (status, _) = send(&app, "DELETE", &format!("/api/sprints/{}", sprint["id"]), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", &format!("/api/tasks/{}", task["id"]), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", &format!("/api/tasks/{}", task["id"]), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, removed) = send(&app, "DELETE", &format!("/api/projects/{project_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(removed, json!({"projects": 1, "sprints": 0, "tasks": 0}));
    }

    #[tokio::test]
    async fn test_create_task_broadcasts_event() {
        let db = AgencyDb::new_in_memory().unwrap();
        let (ws_tx, mut rx) = broadcast::channel(16);
        let app = api_router().with_state(Arc::new(AppState {
            db: DbHandle::new(db),
            ws_tx,
        }));
        let project_id = seed_project(&app).await;
        send(
            &app,
            "POST",
            &format!("/api/projects/{project_id}/tasks"),
            Some(json!({"title": "A"})),
        )
        .await;

        let mut types = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let value: Value = serde_json::from_str(&msg).unwrap();
            types.push(value["type"].as_str().unwrap().to_string());
        }
        assert_eq!(types, vec!["ClientCreated", "ProjectCreated", "TaskCreated"]);
    }

    #[test]
    fn test_contention_maps_to_service_unavailable() {
        let err = BoardError::Slug(SlugError::ContentionExceeded {
            key: "ACME".into(),
            kind: EntityKind::Task,
            attempts: 50,
        });
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = ApiError::from(BoardError::Other(anyhow::anyhow!("disk full"))).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
