//! Media capture: turns a raw captured file into a content-addressed
//! [`MediaItem`]. The sha-256/byte-size pair is the file's immutable
//! identity and lets the remote service detect duplicate uploads.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{TerraError, TerraResult};
use crate::models::MediaItem;

/// Computes the sha-256 hex digest and byte size of a file, over its raw
/// bytes (not any encoded representation). Runs on the blocking pool since
/// captures can be multi-hundred-megabyte videos.
pub async fn hash_file(path: &str) -> TerraResult<(String, u64)> {
    let owned = path.to_string();
    tokio::task::spawn_blocking(move || hash_file_blocking(&owned))
        .await
        .map_err(|e| TerraError::Capture {
            path: path.to_string(),
            reason: format!("hash task failed: {e}"),
        })?
}

fn hash_file_blocking(path: &str) -> TerraResult<(String, u64)> {
    let file = File::open(path).map_err(|e| TerraError::Capture {
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut buf).map_err(|e| TerraError::Capture {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok((hex, total))
}

/// Guesses a MIME type from the file extension. Unknown extensions fall back
/// to a generic byte stream; the remote service only branches on the
/// `video/` prefix.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("heic") => "image/heic",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Builds a [`MediaItem`] for a freshly captured file. Hashing happens
/// before anything else; if the file cannot be read the capture attempt
/// fails and the step stays incomplete for the operator to retry.
pub async fn capture_media(
    step_id: &str,
    path: &str,
    lat: f64,
    lng: f64,
) -> TerraResult<MediaItem> {
    let (content_hash, byte_size) = hash_file(path).await?;

    Ok(MediaItem {
        step_id: step_id.to_string(),
        local_uri: path.to_string(),
        content_hash,
        content_type: content_type_for(path).to_string(),
        byte_size,
        lat,
        lng,
        captured_at: Utc::now().to_rfc3339(),
        uploaded: false,
        remote_key: None,
    })
}
