use std::path::Path as FsPath;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn download_artifact(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
) -> Result<Response, ApiError> {
    let artifact = state
        .store
        .get_artifact(&artifact_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Артефакт не найден"))?;

    let path = FsPath::new(&artifact.content_uri);
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| ApiError::not_found("Файл артефакта не найден"))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());

    let response = (
        [
            (
                axum::http::header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (
                axum::http::header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        bytes,
    )
        .into_response();
    Ok(response)
}
