//! Outbound media fetched by URL.
//!
//! `send_media` takes a source URL; the body is downloaded here, typed, and
//! handed to the underlying client base64-encoded.

use crate::config::MediaConfig;
use crate::error::{MediaError, MediaResult};
use crate::events::MediaPayload;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Url;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;

/// Fallback MIME type when neither the server nor the path says anything.
const OCTET_STREAM: &str = "application/octet-stream";

/// Downloads media for outbound messages.
#[derive(Debug, Clone)]
pub struct MediaFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl MediaFetcher {
    /// Create a fetcher with the given limits.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Request`] if the HTTP client cannot be built.
    pub fn new(config: MediaConfig) -> MediaResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| MediaError::Request(e.to_string()))?;
        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }

    /// Largest accepted body in bytes.
    #[must_use]
    pub const fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Download `url` and wrap it as a media payload.
    ///
    /// # Errors
    ///
    /// Fails on a malformed or non-HTTP URL, a transport error, a non-2xx
    /// status, or a body larger than the configured limit.
    pub async fn fetch(&self, url: &str, caption: Option<String>) -> MediaResult<MediaPayload> {
        let parsed = Url::parse(url).map_err(|e| MediaError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(MediaError::InvalidUrl(format!(
                "{url}: unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let mut response = self
            .client
            .get(parsed.clone())
            .send()
            .await
            .map_err(|e| MediaError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MediaError::Status(status.as_u16()));
        }

        if let Some(announced) = response.content_length()
            && announced > self.max_bytes
        {
            return Err(MediaError::TooLarge {
                size: announced,
                limit: self.max_bytes,
            });
        }

        let header = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| MediaError::Request(e.to_string()))?
        {
            let size = (body.len() + chunk.len()) as u64;
            if size > self.max_bytes {
                return Err(MediaError::TooLarge {
                    size,
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        let mime_type = mime_type_for(header.as_deref(), &parsed);
        let file_name = file_name_for(&parsed, &mime_type);
        debug!(url = %parsed, mime = %mime_type, bytes = body.len(), "media fetched");

        Ok(MediaPayload {
            mime_type,
            file_name,
            data: STANDARD.encode(&body),
            caption,
        })
    }
}

/// MIME type from the `Content-Type` header, else guessed from the path.
fn mime_type_for(header: Option<&str>, url: &Url) -> String {
    let declared = header
        .and_then(|h| h.split(';').next())
        .map(str::trim)
        .filter(|m| !m.is_empty() && *m != OCTET_STREAM);

    match declared {
        Some(mime) => mime.to_ascii_lowercase(),
        None => mime_guess::from_path(url.path())
            .first_raw()
            .unwrap_or(OCTET_STREAM)
            .to_string(),
    }
}

/// Last path segment, or `file.<ext>` when the URL has none.
fn file_name_for(url: &Url, mime_type: &str) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty());

    if let Some(name) = segment {
        return name.to_string();
    }

    match mime_guess::get_mime_extensions_str(mime_type).and_then(|exts| exts.first()) {
        Some(ext) => format!("file.{ext}"),
        None => "file".to_string(),
    }
}
