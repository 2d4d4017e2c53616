//! HTTP API
//!
//! JSON endpoints over a shared [`Provisioner`]. Mutating endpoints answer
//! with a `{"status": ...}` envelope: 201 on success, 404 when required
//! parameters are missing and 501 for any other failure. Listing endpoints
//! return the data itself.
//!
//! Request bodies are optional. An absent body reads as an empty request, so
//! it is reported as missing parameters like any other incomplete request.
//! A body that is not valid for the endpoint answers 501 in the same envelope.
//!
//! Every request runs on a blocking worker since the backends shell out and
//! wait on udev.

use axum::{
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::command::CommandRunner;
use crate::error::{ProvisionError, ProvisionResult};
use crate::iscsi::TargetFabric;
use crate::prep::PrepRequest;
use crate::provision::{CloneEntry, CloneRequest, Provisioner, ReleaseEntry, ReleaseRequest};
use crate::zfs::{ListKind, Properties, VolumeSpec};

/// Command runner usable from request workers
pub trait Runner: CommandRunner + Send + Sync + 'static {}
impl<T: CommandRunner + Send + Sync + 'static> Runner for T {}

/// Target fabric usable from request workers
pub trait Fabric: TargetFabric + Send + 'static {}
impl<T: TargetFabric + Send + 'static> Fabric for T {}

/// Provisioner shared between handlers
pub type Shared<R, F> = Arc<Provisioner<R, F>>;

/// Create or destroy a filesystem, volume or snapshot
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRequest {
    pub name: Option<String>,
    pub create_parent: Option<bool>,
    pub properties: Option<Properties>,
    pub volume: Option<VolumeSpec>,
}

/// Clone a snapshot without exporting it
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZfsCloneRequest {
    pub snapshot: Option<String>,
    pub dest: Option<String>,
    pub properties: Option<Properties>,
    pub create_parent: Option<bool>,
}

/// Export or unexport a device
#[derive(Debug, Default, Deserialize)]
pub struct TargetRequest {
    pub wwn: Option<String>,
    pub device: Option<String>,
    pub initiators: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CloneBatch {
    #[serde(default)]
    pub clones: Vec<CloneEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseBatch {
    #[serde(default)]
    pub clones: Vec<ReleaseEntry>,
}

/// JSON request body that answers with the status envelope when rejected
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| failure(ProvisionError::InvalidRequest(e.body_text())))?;
        parse(&bytes).map(JsonBody).map_err(failure)
    }
}

fn parse<T: DeserializeOwned + Default>(bytes: &[u8]) -> ProvisionResult<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes).map_err(|e| ProvisionError::InvalidRequest(e.to_string()))
}

/// Build the application router
pub fn router<R: Runner, F: Fabric>(provisioner: Shared<R, F>) -> Router {
    Router::new()
        .route("/lun/clone", post(create_clone::<R, F>).delete(delete_clone::<R, F>))
        .route("/lun/clones", post(create_clones::<R, F>).delete(delete_clones::<R, F>))
        .route("/lun/prep", post(prep_lun::<R, F>))
        .route("/zfs/snapshots", get(list_snapshots::<R, F>))
        .route("/zfs/volumes", get(list_volumes::<R, F>))
        .route("/zfs/filesystems", get(list_filesystems::<R, F>))
        .route("/zfs/attributes", get(list_attributes::<R, F>))
        .route("/zfs/filesystem", post(create_filesystem::<R, F>).delete(destroy_dataset::<R, F>))
        .route("/zfs/volume", post(create_volume::<R, F>).delete(destroy_dataset::<R, F>))
        .route("/zfs/snapshot", post(create_snapshot::<R, F>).delete(destroy_dataset::<R, F>))
        .route("/zfs/clone", post(create_zfs_clone::<R, F>).delete(destroy_dataset::<R, F>))
        .route("/target", post(create_target::<R, F>).delete(delete_target::<R, F>))
        .route("/target/backstores", get(list_block_stores::<R, F>))
        .route("/target/iscsi", get(list_targets::<R, F>))
        .with_state(provisioner)
}

/// Run `f` on a blocking worker
async fn blocking<R, F, T>(
    provisioner: Shared<R, F>,
    f: impl FnOnce(&Provisioner<R, F>) -> ProvisionResult<T> + Send + 'static,
) -> ProvisionResult<T>
where
    R: Runner,
    F: Fabric,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&provisioner))
        .await
        .unwrap_or_else(|e| Err(ProvisionError::InvalidState(format!("request worker failed: {}", e))))
}

fn failure(e: ProvisionError) -> Response {
    log::error!("{}", e);
    let code = if e.is_missing_parameter() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NOT_IMPLEMENTED
    };
    (code, Json(json!({ "status": e.to_string() }))).into_response()
}

fn created(result: ProvisionResult<Value>) -> Response {
    match result {
        Ok(body) => (StatusCode::CREATED, Json(body)).into_response(),
        Err(e) => failure(e),
    }
}

fn ok(result: ProvisionResult<()>) -> Response {
    created(result.map(|()| json!({ "status": "ok" })))
}

fn fetched<T: Serialize>(result: ProvisionResult<T>) -> Response {
    match result {
        Ok(data) => Json(data).into_response(),
        Err(e) => failure(e),
    }
}

async fn create_clone<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(request): JsonBody<CloneRequest>,
) -> Response {
    ok(blocking(provisioner, move |p| p.create(&request)).await)
}

async fn delete_clone<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(request): JsonBody<ReleaseRequest>,
) -> Response {
    ok(blocking(provisioner, move |p| p.delete(&request)).await)
}

async fn create_clones<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(batch): JsonBody<CloneBatch>,
) -> Response {
    let result = blocking(provisioner, move |p| p.create_many(&batch.clones)).await;
    created(result.map(|clones| json!({ "status": "ok", "created": clones })))
}

async fn delete_clones<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(batch): JsonBody<ReleaseBatch>,
) -> Response {
    ok(blocking(provisioner, move |p| p.delete_many(&batch.clones)).await)
}

async fn prep_lun<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(request): JsonBody<PrepRequest>,
) -> Response {
    ok(blocking(provisioner, move |p| p.prep(&request)).await)
}

async fn listing<R: Runner, F: Fabric>(provisioner: Shared<R, F>, kind: ListKind) -> Response {
    fetched(
        blocking(provisioner, move |p| {
            let mut zfs = p.volumes();
            let datasets = zfs.list(kind)?.clone();
            Ok(datasets)
        })
        .await,
    )
}

async fn list_snapshots<R: Runner, F: Fabric>(State(provisioner): State<Shared<R, F>>) -> Response {
    listing(provisioner, ListKind::Snapshot).await
}

async fn list_volumes<R: Runner, F: Fabric>(State(provisioner): State<Shared<R, F>>) -> Response {
    listing(provisioner, ListKind::Volume).await
}

async fn list_filesystems<R: Runner, F: Fabric>(State(provisioner): State<Shared<R, F>>) -> Response {
    listing(provisioner, ListKind::Filesystem).await
}

async fn list_attributes<R: Runner, F: Fabric>(State(provisioner): State<Shared<R, F>>) -> Response {
    fetched(
        blocking(provisioner, |p| {
            let mut zfs = p.volumes();
            let attributes = zfs.attributes()?.clone();
            Ok(attributes)
        })
        .await,
    )
}

async fn create_filesystem<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(request): JsonBody<DatasetRequest>,
) -> Response {
    ok(blocking(provisioner, move |p| {
        p.volumes()
            .create(
                request.name.as_deref().unwrap_or_default(),
                &request.properties.unwrap_or_default(),
                None,
                request.create_parent.unwrap_or(false),
            )
            .map(|_| ())
    })
    .await)
}

async fn create_volume<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(request): JsonBody<DatasetRequest>,
) -> Response {
    ok(blocking(provisioner, move |p| {
        let volume = request.volume.unwrap_or_default();
        p.volumes()
            .create(
                request.name.as_deref().unwrap_or_default(),
                &request.properties.unwrap_or_default(),
                Some(&volume),
                request.create_parent.unwrap_or(false),
            )
            .map(|_| ())
    })
    .await)
}

async fn create_snapshot<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(request): JsonBody<DatasetRequest>,
) -> Response {
    ok(blocking(provisioner, move |p| {
        p.volumes()
            .snapshot(request.name.as_deref().unwrap_or_default())
            .map(|_| ())
    })
    .await)
}

async fn create_zfs_clone<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(request): JsonBody<ZfsCloneRequest>,
) -> Response {
    ok(blocking(provisioner, move |p| {
        p.volumes()
            .clone_snapshot(
                request.snapshot.as_deref().unwrap_or_default(),
                request.dest.as_deref().unwrap_or_default(),
                &request.properties.unwrap_or_default(),
                request.create_parent.unwrap_or(false),
            )
            .map(|_| ())
    })
    .await)
}

async fn destroy_dataset<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(request): JsonBody<DatasetRequest>,
) -> Response {
    ok(blocking(provisioner, move |p| {
        p.volumes()
            .destroy(request.name.as_deref().unwrap_or_default())
            .map(|_| ())
    })
    .await)
}

async fn create_target<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(request): JsonBody<TargetRequest>,
) -> Response {
    ok(blocking(provisioner, move |p| {
        p.export(
            request.wwn.as_deref().unwrap_or_default(),
            request.device.as_deref().unwrap_or_default(),
            request.initiators.as_deref().unwrap_or_default(),
        )
    })
    .await)
}

async fn delete_target<R: Runner, F: Fabric>(
    State(provisioner): State<Shared<R, F>>,
    JsonBody(request): JsonBody<TargetRequest>,
) -> Response {
    ok(blocking(provisioner, move |p| {
        p.unexport(request.wwn.as_deref().unwrap_or_default())
    })
    .await)
}

async fn list_block_stores<R: Runner, F: Fabric>(State(provisioner): State<Shared<R, F>>) -> Response {
    fetched(blocking(provisioner, |p| p.registry().map(|r| r.block_stores)).await)
}

async fn list_targets<R: Runner, F: Fabric>(State(provisioner): State<Shared<R, F>>) -> Response {
    fetched(blocking(provisioner, |p| p.registry().map(|r| r.targets)).await)
}
