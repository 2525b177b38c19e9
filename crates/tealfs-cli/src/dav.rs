//! The WebDAV subset served on top of the replicated filesystem.
//!
//! GET, HEAD, PUT, DELETE, MKCOL and MOVE. Paths are taken verbatim from
//! the request URI.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, Method, StatusCode, Uri};
use tealfs_rs::{BlockError, FsError};
use tealfs_rs::fs::{DEFAULT_DIR_MODE, FileSystem};
use tracing::{debug, warn};

pub fn router(fs: FileSystem) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(DefaultBodyLimit::disable())
        .with_state(fs)
}

async fn dispatch(
    State(fs): State<FileSystem>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    debug!("dav: {method} {path}");
    let result = match method.as_str() {
        "GET" => get(&fs, &path, true).await,
        "HEAD" => get(&fs, &path, false).await,
        "PUT" => put(&fs, &path, &body).await,
        "DELETE" => delete(&fs, &path).await,
        "MKCOL" => mkcol(&fs, &path, &body).await,
        "MOVE" => move_to(&fs, &path, &headers).await,
        _ => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    result.unwrap_or_else(|err| error_response(&method, &err))
}

async fn get(fs: &FileSystem, path: &str, with_body: bool) -> Result<Response, FsError> {
    let entry = fs.stat(path).await?;
    let body = if entry.is_dir() {
        let mut listing = String::new();
        for child in fs.read_dir(path).await? {
            listing.push_str(child.name());
            if child.is_dir() {
                listing.push('/');
            }
            listing.push('\n');
        }
        listing.into_bytes()
    } else {
        fs.read_file(path).await?
    };
    if with_body {
        Ok((StatusCode::OK, body).into_response())
    } else {
        Ok(StatusCode::OK.into_response())
    }
}

async fn put(fs: &FileSystem, path: &str, body: &[u8]) -> Result<Response, FsError> {
    let existed = fs.stat(path).await.is_ok();
    fs.write_file(path, body).await?;
    Ok(if existed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    }
    .into_response())
}

async fn delete(fs: &FileSystem, path: &str) -> Result<Response, FsError> {
    fs.stat(path).await?;
    fs.remove_all(path).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn mkcol(fs: &FileSystem, path: &str, body: &[u8]) -> Result<Response, FsError> {
    if !body.is_empty() {
        return Ok(StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response());
    }
    fs.mkdir(path, DEFAULT_DIR_MODE).await?;
    Ok(StatusCode::CREATED.into_response())
}

async fn move_to(fs: &FileSystem, path: &str, headers: &HeaderMap) -> Result<Response, FsError> {
    let Some(destination) = headers
        .get("destination")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.parse::<Uri>().ok())
    else {
        return Ok((StatusCode::BAD_REQUEST, "missing Destination header\n").into_response());
    };
    let overwrite = headers
        .get("overwrite")
        .and_then(|v| v.to_str().ok())
        .is_none_or(|v| !v.trim().eq_ignore_ascii_case("f"));

    let target = destination.path();
    fs.stat(path).await?;
    let replaced = fs.stat(target).await.is_ok();
    if replaced {
        if !overwrite {
            return Ok(StatusCode::PRECONDITION_FAILED.into_response());
        }
        fs.remove_all(target).await?;
    }
    fs.rename(path, target).await?;
    Ok(if replaced {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    }
    .into_response())
}

fn error_response(method: &Method, err: &FsError) -> Response {
    let status = match err {
        FsError::NotFound(_) => StatusCode::NOT_FOUND,
        FsError::AlreadyExists(_) if method.as_str() == "MKCOL" => StatusCode::METHOD_NOT_ALLOWED,
        FsError::AlreadyExists(_) => StatusCode::PRECONDITION_FAILED,
        FsError::MissingParent(_) | FsError::NotADirectory(_) => StatusCode::CONFLICT,
        FsError::IsADirectory(_) => StatusCode::METHOD_NOT_ALLOWED,
        FsError::InvalidPath(_) | FsError::InvalidFlags(_) => StatusCode::BAD_REQUEST,
        FsError::FileTooLarge | FsError::BlockPut(BlockError::TooLarge(_)) => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        FsError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("dav: {method} failed: {err}");
    }
    (status, format!("{err}\n")).into_response()
}
