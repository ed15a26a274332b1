//! Storage-bucket client.
//!
//! Buckets are key/opaque-bytes stores owned by one actor. Writes and
//! deletes require the owner's token; reads are public, since object bytes
//! are content-addressed and carry their own integrity. GET streams the
//! body into a buffer bounded by the caller's byte limit so an adversarial
//! bucket cannot balloon memory.

use futures_util::StreamExt as _;

use crate::codec;
use crate::error::GraffitiError;
use crate::protocol::{decode_key_page, KeyPage};
use crate::transport::{bearer, join, require_success};

/// Client for storage-bucket endpoints.
#[derive(Clone)]
pub struct BucketClient {
    http: reqwest::Client,
}

impl BucketClient {
    pub fn new(http: reqwest::Client) -> Self {
        BucketClient { http }
    }

    fn value_url(endpoint: &str, key: &str) -> String {
        join(endpoint, &format!("value/{}", codec::escape_component(key)))
    }

    /// Store opaque bytes under `key`.
    pub async fn put(
        &self,
        endpoint: &str,
        key: &str,
        bytes: Vec<u8>,
        token: &str,
    ) -> Result<(), GraffitiError> {
        let request = self
            .http
            .put(Self::value_url(endpoint, key))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        let response = bearer(request, Some(token)).send().await?;
        require_success(response, &format!("put {key} to {endpoint}"))?;
        Ok(())
    }

    /// Delete the value under `key`.
    pub async fn delete(&self, endpoint: &str, key: &str, token: &str) -> Result<(), GraffitiError> {
        let request = self.http.delete(Self::value_url(endpoint, key));
        let response = bearer(request, Some(token)).send().await?;
        require_success(response, &format!("delete {key} from {endpoint}"))?;
        Ok(())
    }

    /// Fetch the value under `key`, streaming at most `max_bytes`.
    ///
    /// A valid `Content-Length` over the limit fails fast before any body
    /// read; without one, the running total is checked per chunk. A body
    /// shorter than its declared length is rejected as truncated.
    pub async fn get(
        &self,
        endpoint: &str,
        key: &str,
        max_bytes: Option<usize>,
    ) -> Result<Vec<u8>, GraffitiError> {
        let response = self.http.get(Self::value_url(endpoint, key)).send().await?;
        let response = require_success(response, &format!("get {key} from {endpoint}"))?;

        let declared = response.content_length();
        if let (Some(declared), Some(max)) = (declared, max_bytes) {
            if declared > max as u64 {
                return Err(GraffitiError::TooLarge(format!(
                    "value is {declared} bytes, limit is {max}"
                )));
            }
        }

        let mut buf: Vec<u8> = match declared {
            Some(declared) => Vec::with_capacity(declared as usize),
            None => Vec::new(),
        };
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
            match declared {
                Some(declared) => {
                    if buf.len() as u64 > declared {
                        return Err(GraffitiError::ProtocolViolation(format!(
                            "body exceeds declared length of {declared} bytes"
                        )));
                    }
                }
                None => {
                    if let Some(max) = max_bytes {
                        if buf.len() > max {
                            return Err(GraffitiError::TooLarge(format!(
                                "value exceeds the {max} byte limit"
                            )));
                        }
                    }
                }
            }
        }
        if let Some(declared) = declared {
            if (buf.len() as u64) < declared {
                return Err(GraffitiError::Transport(format!(
                    "truncated body: {} of {declared} bytes",
                    buf.len()
                )));
            }
        }
        Ok(buf)
    }

    /// One page of the bucket's key listing. Values are never included.
    pub async fn export(
        &self,
        endpoint: &str,
        token: &str,
        cursor: Option<&str>,
    ) -> Result<KeyPage, GraffitiError> {
        let mut url = join(endpoint, "export");
        if let Some(cursor) = cursor {
            url.push_str(&format!("?cursor={}", codec::escape_component(cursor)));
        }
        let response = bearer(self.http.get(url), Some(token)).send().await?;
        let response = require_success(response, &format!("export {endpoint}"))?;
        decode_key_page(&response.bytes().await?)
    }

    /// Every key in the bucket, following export cursors to exhaustion.
    pub async fn export_all(&self, endpoint: &str, token: &str) -> Result<Vec<String>, GraffitiError> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.export(endpoint, token, cursor.as_deref()).await?;
            keys.extend(page.keys);
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(keys),
            }
        }
    }

    /// The authorization endpoint this bucket advertises.
    pub async fn auth_endpoint(&self, endpoint: &str) -> Result<String, GraffitiError> {
        crate::transport::fetch_auth_endpoint(&self.http, endpoint).await
    }
}
