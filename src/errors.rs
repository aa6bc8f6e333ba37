//! Error taxonomy (spec §7) and its mapping onto HTTP status codes.
//!
//! CLI subcommands keep threading `anyhow::Result` the way the teacher's
//! `main.rs` does; only the HTTP-facing paths need the typed variants below,
//! since each one maps to exactly one status code a client can branch on.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid SPK")]
    InvalidSpk,
    #[error("Missing INFO file")]
    MissingInfo,
    #[error("Missing package.tgz file")]
    MissingPackageTgz,
    #[error("Wrong LICENSE encoding")]
    WrongLicenseEncoding,
    #[error("Wrong syno_signature.asc encoding")]
    WrongSignatureEncoding,
    #[error("Wrong INFO encoding")]
    WrongInfoEncoding,
    #[error("Wrong {0} encoding")]
    WrongConfEncoding(&'static str),
    #[error("Invalid INFO")]
    InvalidInfo,
    #[error("Invalid INFO icon: {0}")]
    InvalidIcon(String),
    #[error("Invalid INFO boolean: {0}")]
    InvalidBoolean(String),
    #[error("Invalid INFO package")]
    InvalidPackage,
    #[error("Missing INFO: {0}")]
    MissingInfoKeys(String),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
    #[error("Missing 72px icon")]
    Missing72pxIcon,
    #[error("Missing conf folder")]
    MissingConf,
    #[error("Empty conf folder")]
    EmptyConf,
    #[error("File {0} is not valid JSON")]
    InvalidJson(&'static str),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid firmware")]
    InvalidFirmware,
    #[error("Unknown firmware")]
    UnknownFirmware,
    #[error("Unknown architecture: {0}")]
    UnknownArchitecture(String),
    #[error("Invalid version")]
    InvalidVersion,
    #[error("Package contains a signature")]
    SignedUpload,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing API key")]
    MissingKey,
    #[error("Invalid API key")]
    InvalidKey,
    #[error("Insufficient permissions to create new packages")]
    NotDeveloper,
    #[error("Insufficient permissions on this package")]
    InsufficientPermissions,
}

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("Conflicting architectures: {0}")]
    ArchitectureConflict(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Unknown architecture")]
    UnknownArch,
    #[error("Unknown language")]
    UnknownLanguage,
    #[error("Invalid build number")]
    InvalidBuild,
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("Failed to sign package")]
    SignFailed,
    #[error("Timestamp server did not respond in time")]
    TimestampTimeout,
    #[error("Failed to save files")]
    FilesystemWriteFailed,
    #[error("Package is already signed")]
    AlreadySigned,
    #[error("Package is not signed")]
    NotSigned,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Build is not active")]
    BuildInactive,
    #[error("Unknown architecture")]
    UnknownArchitecture,
    #[error("Architecture not available for this build")]
    ArchitectureMismatch,
    #[error("Firmware build out of range for this build")]
    FirmwareOutOfRange,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("Not found")]
    NotFound,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Upload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Auth(AuthError::MissingKey | AuthError::InvalidKey) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Auth(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Query(QueryError::MissingField(_)) => StatusCode::BAD_REQUEST,
            AppError::Query(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Download(DownloadError::BuildInactive) => StatusCode::FORBIDDEN,
            AppError::Download(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("request failed: {:?}", self);
        }
        let body = ErrorBody {
            message: self.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}
