//! Axum read surface over the snapshots, plus the mailing-list endpoint.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use cima_adapters::{upsert_mailing, MailingReceipt, TableClient};
use cima_core::{DataType, Document, Entity, Event, EventStatus, Person, ATTACHMENT_EXTENSION};
use cima_sync::{SnapshotRecord, SnapshotStore};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod error;

pub use error::ApiError;

pub const CRATE_NAME: &str = "cima-web";

#[derive(Clone)]
pub struct AppState {
    pub snapshots: SnapshotStore,
    pub upstream: Arc<dyn TableClient>,
    pub mailing_table: String,
}

impl AppState {
    pub fn new(
        snapshots: SnapshotStore,
        upstream: Arc<dyn TableClient>,
        mailing_table: impl Into<String>,
    ) -> Self {
        Self {
            snapshots,
            upstream,
            mailing_table: mailing_table.into(),
        }
    }
}

/// Document as listed: no attachment path, no full text.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentListing {
    pub id: String,
    pub name: String,
    pub summary: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub creation_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub authors: Vec<String>,
}

impl From<Document> for DocumentListing {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            name: doc.name,
            summary: doc.summary,
            data_type: doc.data_type,
            creation_time: doc.creation_time,
            last_modified: doc.last_modified,
            authors: doc.authors,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventListing {
    pub id: String,
    pub name: String,
    pub summary: String,
    pub status: EventStatus,
    pub tags: Vec<String>,
    pub date: DateTime<Utc>,
    pub location_url: Option<String>,
    pub registration_url: Option<String>,
}

impl From<Event> for EventListing {
    fn from(event: Event) -> Self {
        Self {
            id: event.id,
            name: event.name,
            summary: event.summary,
            status: event.status,
            tags: event.tags,
            date: event.date,
            location_url: event.location_url,
            registration_url: event.registration_url,
        }
    }
}

/// Person with the local photo path swapped for the URL that serves it.
#[derive(Debug, Clone, Serialize)]
pub struct PersonView {
    pub id: String,
    pub name: String,
    pub tagline: String,
    pub description: String,
    pub email: String,
    pub linkedin: String,
    #[serde(rename = "attachmentUrl")]
    pub attachment_url: Option<String>,
}

impl From<Person> for PersonView {
    fn from(person: Person) -> Self {
        let attachment_url = person
            .photo
            .as_ref()
            .map(|_| format!("/people/attachments/{}", person.id));
        Self {
            id: person.id,
            name: person.name,
            tagline: person.tagline,
            description: person.description,
            email: person.email,
            linkedin: person.linkedin,
            attachment_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MailingQuery {
    email: String,
}

pub fn app(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/data", get(list_documents))
        .route("/data/text/{id}", get(get_document))
        .route("/data/attachments/{id}", get(document_attachment))
        .route("/events", get(list_events))
        .route("/events/{id}", get(get_event))
        .route("/events/attachments/{id}", get(event_attachment))
        .route("/people", get(list_people))
        .route("/people/{id}", get(get_person))
        .route("/people/attachments/{id}", get(person_attachment))
        .route("/mailing", post(add_to_mailing_list))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    // Credentials rule out wildcards, so methods and headers mirror the request.
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("http server stopped");
    Ok(())
}

/// Snapshot reads are blocking file I/O; keep them off the async workers.
async fn read_snapshot<T, F>(state: &AppState, read: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SnapshotStore) -> anyhow::Result<T> + Send + 'static,
{
    let snapshots = state.snapshots.clone();
    tokio::task::spawn_blocking(move || read(&snapshots))
        .await
        .map_err(|err| ApiError::Internal(err.into()))?
        .map_err(ApiError::from)
}

async fn find<T>(state: &AppState, id: String) -> Result<T, ApiError>
where
    T: SnapshotRecord + Send + 'static,
{
    let lookup = id.clone();
    read_snapshot(state, move |store| store.get::<T>(&lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{} {id} not found", T::KIND)))
}

async fn attachment<T>(state: &AppState, id: String) -> Result<Response, ApiError>
where
    T: SnapshotRecord + Send + 'static,
{
    let entity: T = find(state, id.clone()).await?;
    let path = entity
        .attachment_path()
        .map(PathBuf::from)
        .ok_or_else(|| ApiError::NotFound(format!("{} {id} has no attachment", T::KIND)))?;
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!(
                "attachment for {} {id} is missing on disk",
                T::KIND
            )))
        }
        Err(err) => {
            return Err(ApiError::Internal(
                anyhow::Error::new(err).context(format!("reading {}", path.display())),
            ))
        }
    };
    let disposition = format!("attachment; filename={id}.{ATTACHMENT_EXTENSION}");
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn list_documents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DocumentListing>>, ApiError> {
    let docs = read_snapshot(&state, |store| store.read::<Document>()).await?;
    Ok(Json(docs.into_iter().map(DocumentListing::from).collect()))
}

async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    Ok(Json(find(&state, id).await?))
}

async fn document_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    attachment::<Document>(&state, id).await
}

async fn list_events(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<EventListing>>, ApiError> {
    let events = read_snapshot(&state, |store| store.read::<Event>()).await?;
    Ok(Json(events.into_iter().map(EventListing::from).collect()))
}

async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Event>, ApiError> {
    Ok(Json(find(&state, id).await?))
}

async fn event_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    attachment::<Event>(&state, id).await
}

async fn list_people(State(state): State<Arc<AppState>>) -> Result<Json<Vec<PersonView>>, ApiError> {
    let people = read_snapshot(&state, |store| store.read::<Person>()).await?;
    Ok(Json(people.into_iter().map(PersonView::from).collect()))
}

async fn get_person(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PersonView>, ApiError> {
    let person: Person = find(&state, id).await?;
    Ok(Json(person.into()))
}

async fn person_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    attachment::<Person>(&state, id).await
}

async fn add_to_mailing_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MailingQuery>,
) -> Result<Json<MailingReceipt>, ApiError> {
    let receipt = upsert_mailing(
        state.upstream.as_ref(),
        &state.mailing_table,
        &[query.email],
    )
    .await?;
    Ok(Json(receipt))
}
