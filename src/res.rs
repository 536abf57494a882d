use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use uuid::Uuid;

use crate::appresult::RelayError;

const DATA_URL_PREFIX: &str = "data:image/";
const DEFAULT_EXTENSION: &str = "jpg";

/// Decodes an inline base64 image (optionally wrapped in a `data:image/...,` URL) and writes
/// it under `content_dir` with a fresh name. Returns the path relative to `content_dir`.
pub async fn materialize(content_dir: &Path, payload: &str) -> Result<PathBuf, RelayError> {
    let (extension, encoded) = split_data_url(payload)?;
    let bytes = STANDARD.decode(encoded.trim())?;

    tokio::fs::create_dir_all(content_dir).await?;

    let file_name = PathBuf::from(format!("image_{}.{extension}", Uuid::now_v7().simple()));
    tokio::fs::write(content_dir.join(&file_name), &bytes).await?;

    tracing::debug!(file = %file_name.display(), bytes = bytes.len(), "image materialized");
    Ok(file_name)
}

/// `data:image/png;base64,AAAA` -> `("png", "AAAA")`. Bare payloads pass through.
fn split_data_url(payload: &str) -> Result<(&str, &str), RelayError> {
    let Some(framed) = payload.strip_prefix(DATA_URL_PREFIX) else {
        return Ok((DEFAULT_EXTENSION, payload));
    };

    let (header, encoded) = framed
        .split_once(',')
        .ok_or_else(|| RelayError::Decode("data URL without a payload section".to_owned()))?;

    let subtype = header.split(';').next().unwrap_or_default();
    let extension = match subtype {
        "jpeg" => DEFAULT_EXTENSION,
        s if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()) => s,
        _ => DEFAULT_EXTENSION,
    };

    Ok((extension, encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1x1 transparent png
    const PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    #[test]
    fn strips_data_url_header() {
        let payload = format!("data:image/png;base64,{PNG}");
        assert_eq!(split_data_url(&payload).unwrap(), ("png", PNG));
    }

    #[test]
    fn jpeg_and_odd_subtypes_use_jpg() {
        assert_eq!(split_data_url("data:image/jpeg;base64,AA==").unwrap().0, "jpg");
        assert_eq!(split_data_url("data:image/svg+xml;base64,AA==").unwrap().0, "jpg");
        assert_eq!(split_data_url("AA==").unwrap(), ("jpg", "AA=="));
    }

    #[tokio::test]
    async fn writes_decoded_bytes_and_creates_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let content_dir = tmp.path().join("images");

        let file = materialize(&content_dir, &format!("data:image/png;base64,{PNG}"))
            .await
            .unwrap();

        let name = file.to_str().unwrap();
        assert!(name.starts_with("image_") && name.ends_with(".png"), "{name}");
        let written = std::fs::read(content_dir.join(&file)).unwrap();
        assert_eq!(written, STANDARD.decode(PNG).unwrap());
    }

    #[tokio::test]
    async fn names_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let a = materialize(tmp.path(), PNG).await.unwrap();
        let b = materialize(tmp.path(), PNG).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn data_url_without_comma_is_decode_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = materialize(tmp.path(), "data:image/png;base64").await.unwrap_err();
        assert!(matches!(err, RelayError::Decode(_)), "{err}");
    }

    #[tokio::test]
    async fn malformed_base64_is_decode_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = materialize(tmp.path(), "definitely not base64!!").await.unwrap_err();
        assert!(matches!(err, RelayError::Decode(_)), "{err}");
    }

    #[tokio::test]
    async fn unwritable_dir_is_storage_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("taken");
        std::fs::write(&blocker, b"a file, not a dir").unwrap();

        let err = materialize(&blocker, PNG).await.unwrap_err();
        assert!(matches!(err, RelayError::Storage(_)), "{err}");
    }
}
