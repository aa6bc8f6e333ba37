//! HTTP surface (spec §6): one `axum` router over the upload reconciler,
//! the catalog resolver, and the handful of admin/download endpoints. The
//! teacher carries no HTTP server of its own (it is a batch scanner); the
//! router/state shape here follows the sibling package-repository-server
//! examples in the retrieval pack that pair Postgres with axum + tower-http.

use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Form, Json, Router};
use sequoia_openpgp::Cert;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::auth::Principal;
use crate::cache::CatalogCache;
use crate::catalog::{self, CatalogQuery};
use crate::config::Config;
use crate::errors::{AppError, AuthError, DownloadError};
use crate::reconcile::{self, UploadRequest};
use crate::sign::DetachedSigner;

pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub cache: CatalogCache,
    pub signer: Option<Arc<dyn DetachedSigner + Send + Sync>>,
    pub signing_cert: Option<Cert>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_upload_bytes as usize;

    Router::new()
        .route("/api/packages", post(upload_package))
        .route("/api/packages/{build_id}/resync", post(resync_package))
        .route("/api/builds/{build_id}", patch(toggle_build_active))
        .route("/nas/", get(catalog_get).post(catalog_post))
        .route(
            "/nas/download/{arch_id}/{fw_build}/{build_id}",
            get(download_build),
        )
        .route("/nas/{*path}", get(serve_static))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn upload_package(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut bytes = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::Other(err.into()))?
    {
        if field.name() == Some("package") {
            bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|err| AppError::Other(err.into()))?,
            );
        }
    }
    let bytes = bytes.ok_or(crate::errors::ParseError::MissingPackageTgz)?;

    let outcome = reconcile::reconcile_upload(
        &state.pool,
        UploadRequest {
            bytes: &bytes,
            data_root: FsPath::new(&state.config.data_path),
            principal: &principal,
            signer: state.signer.as_deref(),
        },
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "package": outcome.package_name,
            "version": outcome.version_string,
            "firmware": outcome.firmware_string,
            "architectures": outcome.architecture_codes,
            "build_id": outcome.build_id,
        })),
    )
        .into_response())
}

async fn resync_package(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(build_id): Path<i32>,
) -> Result<Json<Value>, AppError> {
    let outcome = reconcile::resync_build(
        &state.pool,
        build_id,
        &principal,
        FsPath::new(&state.config.data_path),
    )
    .await?;

    Ok(Json(json!({
        "package": outcome.package_name,
        "version": outcome.version_string,
        "firmware": outcome.firmware_string,
        "architectures": outcome.architecture_codes,
        "build_id": outcome.build_id,
    })))
}

#[derive(Deserialize)]
struct ActivePatch {
    active: bool,
}

async fn toggle_build_active(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(build_id): Path<i32>,
    Json(patch): Json<ActivePatch>,
) -> Result<Json<Value>, AppError> {
    let build = crate::db::find_build_by_id(&state.pool, build_id)
        .await
        .map_err(AppError::Other)?
        .ok_or(AppError::NotFound)?;
    let version = crate::db::find_version_by_id(&state.pool, build.version_id)
        .await
        .map_err(AppError::Other)?
        .ok_or(AppError::NotFound)?;
    let is_maintainer =
        crate::db::is_package_maintainer(&state.pool, version.package_id, principal.user_id)
            .await
            .map_err(AppError::Other)?;
    if !(principal.can_administer_packages() || is_maintainer) {
        return Err(AuthError::InsufficientPermissions.into());
    }

    let updated = crate::db::set_build_active(&state.pool, build_id, patch.active)
        .await
        .map_err(AppError::Other)?
        .ok_or(AppError::NotFound)?;

    Ok(Json(json!({ "build_id": updated.id, "active": updated.active })))
}

#[derive(Deserialize)]
struct CatalogForm {
    arch: String,
    build: i32,
    language: String,
    major: Option<i32>,
    package_update_channel: Option<String>,
}

async fn catalog_query(state: Arc<AppState>, form: CatalogForm) -> Result<Json<Value>, AppError> {
    let query = CatalogQuery {
        arch: form.arch,
        build: form.build,
        major: form.major,
        language: form.language,
        beta_requested: form.package_update_channel.as_deref() == Some("beta"),
    };
    let body = catalog::get_catalog(
        &state.pool,
        &state.cache,
        &state.config.public_base_url,
        state.signing_cert.as_ref(),
        query,
    )
    .await?;
    Ok(Json(body))
}

async fn catalog_get(
    State(state): State<Arc<AppState>>,
    Query(form): Query<CatalogForm>,
) -> Result<Json<Value>, AppError> {
    catalog_query(state, form).await
}

async fn catalog_post(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CatalogForm>,
) -> Result<Json<Value>, AppError> {
    catalog_query(state, form).await
}

/// `GET /nas/download/{arch_id}/{fw_build}/{build_id}` (spec §4.5).
async fn download_build(
    State(state): State<Arc<AppState>>,
    Path((arch_id, fw_build, build_id)): Path<(i32, i32, i32)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let build = crate::db::find_build_by_id(&state.pool, build_id)
        .await
        .map_err(AppError::Other)?
        .ok_or(AppError::NotFound)?;
    if !build.active {
        return Err(DownloadError::BuildInactive.into());
    }

    let architecture = crate::db::find_architecture_by_id(&state.pool, arch_id)
        .await
        .map_err(AppError::Other)?
        .ok_or(AppError::NotFound)?;
    let bound_ids = crate::db::build_architecture_ids(&state.pool, build.id)
        .await
        .map_err(AppError::Other)?;
    if !bound_ids.contains(&architecture.id) {
        return Err(DownloadError::ArchitectureMismatch.into());
    }

    let firmware_min = crate::db::find_firmware_by_id(&state.pool, build.firmware_min_id)
        .await
        .map_err(AppError::Other)?
        .ok_or(AppError::NotFound)?;
    if fw_build < firmware_min.build {
        return Err(DownloadError::FirmwareOutOfRange.into());
    }
    if let Some(max_id) = build.firmware_max_id {
        let firmware_max = crate::db::find_firmware_by_id(&state.pool, max_id)
            .await
            .map_err(AppError::Other)?
            .ok_or(AppError::NotFound)?;
        if fw_build > firmware_max.build {
            return Err(DownloadError::FirmwareOutOfRange.into());
        }
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    crate::db::insert_download(
        &state.pool,
        build.id,
        architecture.id,
        fw_build,
        &addr.ip().to_string(),
        user_agent,
    )
    .await
    .map_err(AppError::Other)?;

    // spec §6 requires a 302 redirect; `Redirect::to` emits 303 (See Other).
    let url = format!("{}/{}", state.config.public_base_url, build.path);
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}

fn content_type_for(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("asc") => "text/plain; charset=utf-8",
        Some("spk" | "tgz") => "application/octet-stream",
        _ => "application/octet-stream",
    }
}

fn escapes_data_root(relative: &FsPath) -> bool {
    relative
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}

/// `GET /nas/<path>`: streams a file under the data root (spec §6). Rejects
/// any path containing a `..` component rather than trusting the router's
/// own normalization.
async fn serve_static(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let relative = PathBuf::from(&path);
    if escapes_data_root(&relative) {
        return Err(AppError::NotFound);
    }

    let full_path = FsPath::new(&state.config.data_path).join(&relative);
    let bytes = tokio::fs::read(&full_path)
        .await
        .map_err(|_| AppError::NotFound)?;

    Ok((
        [(header::CONTENT_TYPE, content_type_for(&full_path))],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type_for(FsPath::new("icon_72.png")), "image/png");
        assert_eq!(
            content_type_for(FsPath::new("syno_signature.asc")),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            content_type_for(FsPath::new("nzbget.v11.f1594[88f628x].spk")),
            "application/octet-stream"
        );
        assert_eq!(content_type_for(FsPath::new("no_extension")), "application/octet-stream");
    }

    #[test]
    fn rejects_parent_dir_components() {
        assert!(escapes_data_root(FsPath::new("../etc/passwd")));
        assert!(escapes_data_root(FsPath::new("nzbget/../../etc/passwd")));
        assert!(!escapes_data_root(FsPath::new("nzbget/11/nzbget.v11.f1594.spk")));
    }
}
