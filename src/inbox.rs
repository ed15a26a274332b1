//! Inbox client: send, label, get, and resumable paged query/export
//! streams.
//!
//! Inboxes are append-only tagged-message stores. Queries are paged; the
//! client caches every page (messages in store `m`, per-query state in
//! store `q`) so a stream can be re-entered mid-flight after a restart, and
//! so concurrent readers of the same query replay from cache instead of
//! hammering the server. A per-query advisory lock makes each cache key
//! single-writer: one reader advances the server cursor at a time, the
//! rest block and then replay.
//!
//! Rate limits are honored persistently: an honored `Retry-After` sets a
//! `wait_til` timestamp stored next to the cursor, so a restarted process
//! still waits out the window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::{message_key, CacheStore, QueryRecord};
use crate::codec;
use crate::error::GraffitiError;
use crate::glog;
use crate::protocol::{
    cbor_to_vec, decode_query_page, decode_send_response, encode_label_body, encode_query_body,
    Label, LabeledMessage, Message,
};
use crate::schema::Schema;
use crate::transport::{bearer, join, require_success, retry_after, status_error, CBOR_CONTENT_TYPE};

/// Page fetches give up after this many attempts (rate-limit and transient
/// server errors in between are waited out).
const MAX_PAGE_ATTEMPTS: u32 = 4;

/// Fallback backoff when a retryable response carries no `Retry-After`.
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Advisory locks
// ---------------------------------------------------------------------------

/// In-process registry of per-query advisory locks, keyed by cache key.
/// Stands in for a platform named-lock primitive; within one process it
/// gives the same single-writer guarantee.
#[derive(Default)]
pub struct QueryLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl QueryLocks {
    pub fn new() -> Self {
        QueryLocks::default()
    }

    fn for_key(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// What a stream is paging over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Query,
    Export,
}

impl StreamKind {
    fn path(self) -> &'static str {
        match self {
            StreamKind::Query => "query",
            StreamKind::Export => "export",
        }
    }

    fn parse(name: &str) -> Result<Self, GraffitiError> {
        match name {
            "query" => Ok(StreamKind::Query),
            "export" => Ok(StreamKind::Export),
            other => Err(GraffitiError::CursorExpired(format!(
                "unknown stream kind in cursor: {other}"
            ))),
        }
    }
}

/// Client for inbox endpoints.
#[derive(Clone)]
pub struct InboxClient {
    http: reqwest::Client,
    cache: Arc<dyn CacheStore>,
    locks: Arc<QueryLocks>,
}

impl InboxClient {
    pub fn new(http: reqwest::Client, cache: Arc<dyn CacheStore>) -> Self {
        InboxClient {
            http,
            cache,
            locks: Arc::new(QueryLocks::new()),
        }
    }

    /// Announce a message. Sends are unauthenticated at the transport
    /// layer; integrity rests on the object's attestations.
    pub async fn send(&self, endpoint: &str, message: &Message) -> Result<String, GraffitiError> {
        let body = message.to_bytes()?;
        let response = self
            .http
            .put(join(endpoint, "send"))
            .header(reqwest::header::CONTENT_TYPE, CBOR_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        let response = require_success(response, &format!("send to {endpoint}"))?;
        decode_send_response(&response.bytes().await?)
    }

    /// Fetch one message, cache-first.
    pub async fn get(
        &self,
        endpoint: &str,
        id: &str,
        token: Option<&str>,
    ) -> Result<LabeledMessage, GraffitiError> {
        let key = message_key(endpoint, id);
        if let Some(cached) = self.cache.get_message(&key)? {
            return Ok(cached);
        }
        let url = join(endpoint, &format!("message/{}", codec::escape_component(id)));
        let response = bearer(self.http.get(url), token).send().await?;
        let response = require_success(response, &format!("get message {id} from {endpoint}"))?;
        let message = LabeledMessage::from_bytes(&response.bytes().await?)?;
        self.cache.put_message(&key, &message)?;
        Ok(message)
    }

    /// Relabel a message.
    ///
    /// The local cache copy is always updated so later offline validation
    /// skips the work; the wire call happens only when a token is
    /// supplied.
    pub async fn label(
        &self,
        endpoint: &str,
        id: &str,
        label: Label,
        token: Option<&str>,
    ) -> Result<(), GraffitiError> {
        let key = message_key(endpoint, id);
        if let Some(mut cached) = self.cache.get_message(&key)? {
            cached.label = label;
            self.cache.put_message(&key, &cached)?;
        }
        if let Some(token) = token {
            let url = join(endpoint, &format!("label/{}", codec::escape_component(id)));
            let response = bearer(self.http.put(url), Some(token))
                .header(reqwest::header::CONTENT_TYPE, CBOR_CONTENT_TYPE)
                .body(encode_label_body(label)?)
                .send()
                .await?;
            require_success(response, &format!("label message {id} at {endpoint}"))?;
        }
        Ok(())
    }

    /// Open a resumable stream over messages filed under any of `tags`.
    pub async fn query(
        &self,
        endpoint: &str,
        tags: Vec<Vec<u8>>,
        schema: Schema,
        token: Option<&str>,
    ) -> Result<QueryStream, GraffitiError> {
        self.open_stream(endpoint, StreamKind::Query, tags, schema, token)
            .await
    }

    /// Open a resumable stream over every message in the inbox.
    pub async fn export(&self, endpoint: &str, token: &str) -> Result<QueryStream, GraffitiError> {
        self.open_stream(
            endpoint,
            StreamKind::Export,
            Vec::new(),
            Schema::any(),
            Some(token),
        )
        .await
    }

    /// Re-enter a stream from a serialized cursor. The cursor must match
    /// the cached stream state; a rotated version or an evicted cache
    /// entry surfaces as `CursorExpired`.
    pub async fn continue_stream(
        &self,
        cursor: &str,
        token: Option<&str>,
    ) -> Result<QueryStream, GraffitiError> {
        let parsed = ClientCursor::decode(cursor)?;
        let record = self
            .cache
            .get_query(&parsed.cache_key)?
            .ok_or_else(|| GraffitiError::CursorExpired("no cached state for cursor".into()))?;
        if record.version != parsed.version {
            return Err(GraffitiError::CursorExpired(
                "cached stream state was rotated".into(),
            ));
        }
        let mut tags = Vec::with_capacity(parsed.tags.len());
        for tag in &parsed.tags {
            tags.push(codec::decode_bytes(tag).map_err(|e| {
                GraffitiError::CursorExpired(format!("undecodable tag in cursor: {e}"))
            })?);
        }
        let schema = Schema::compile(&parsed.schema)
            .map_err(|e| GraffitiError::InvalidSchema(e.to_string()))?;
        Ok(QueryStream {
            http: self.http.clone(),
            cache: self.cache.clone(),
            locks: self.locks.clone(),
            endpoint: parsed.endpoint,
            kind: StreamKind::parse(&parsed.kind)?,
            tags,
            schema,
            token: token.map(|t| t.to_string()),
            cache_key: parsed.cache_key,
            version: parsed.version,
            num_seen: parsed.num_seen,
            continuation: true,
            restarted: false,
            done: false,
        })
    }

    /// The authorization endpoint this inbox advertises.
    pub async fn auth_endpoint(&self, endpoint: &str) -> Result<String, GraffitiError> {
        crate::transport::fetch_auth_endpoint(&self.http, endpoint).await
    }

    async fn open_stream(
        &self,
        endpoint: &str,
        kind: StreamKind,
        tags: Vec<Vec<u8>>,
        schema: Schema,
        token: Option<&str>,
    ) -> Result<QueryStream, GraffitiError> {
        let cache_key = query_cache_key(endpoint, kind, &tags, &schema)?;

        // Create the query record under the advisory lock so two fresh
        // streams for the same key agree on one version.
        let lock = self.locks.for_key(&cache_key);
        let version = {
            let _guard = lock.lock().await;
            match self.cache.get_query(&cache_key)? {
                Some(record) => record.version,
                None => {
                    let record = QueryRecord {
                        cursor: None,
                        version: rand::rngs::OsRng.next_u64(),
                        message_ids: Vec::new(),
                        wait_til: None,
                    };
                    self.cache.put_query(&cache_key, &record)?;
                    record.version
                }
            }
        };

        Ok(QueryStream {
            http: self.http.clone(),
            cache: self.cache.clone(),
            locks: self.locks.clone(),
            endpoint: endpoint.to_string(),
            kind,
            tags,
            schema,
            token: token.map(|t| t.to_string()),
            cache_key,
            version,
            num_seen: 0,
            continuation: false,
            restarted: false,
            done: false,
        })
    }
}

/// Cache key for a query: hash of the endpoint, stream kind, and request
/// body, so parallel sessions against different endpoints or bodies never
/// collide.
fn query_cache_key(
    endpoint: &str,
    kind: StreamKind,
    tags: &[Vec<u8>],
    schema: &Schema,
) -> Result<String, GraffitiError> {
    use ciborium::Value;
    let mut entries = vec![
        (Value::Text("url".into()), Value::Text(endpoint.into())),
        (Value::Text("type".into()), Value::Text(kind.path().into())),
    ];
    if kind == StreamKind::Query {
        let body = encode_query_body(tags, schema.as_value())?;
        entries.push((Value::Text("body".into()), Value::Bytes(body)));
    }
    let bytes = cbor_to_vec(&Value::Map(entries))?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Serialized stream position. Opaque to callers; survives process
/// restarts as long as the cached stream state does.
#[derive(Debug, Serialize, Deserialize)]
struct ClientCursor {
    cache_key: String,
    version: u64,
    num_seen: usize,
    endpoint: String,
    kind: String,
    tags: Vec<String>,
    schema: serde_json::Value,
}

impl ClientCursor {
    fn encode(&self) -> Result<String, GraffitiError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| GraffitiError::Cache(crate::cache::CacheError::Serde(e)))?;
        Ok(codec::encode_bytes(&json))
    }

    fn decode(cursor: &str) -> Result<Self, GraffitiError> {
        let bytes = codec::decode_bytes(cursor)
            .map_err(|e| GraffitiError::CursorExpired(format!("undecodable cursor: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GraffitiError::CursorExpired(format!("undecodable cursor: {e}")))
    }
}

enum FetchOutcome {
    /// Page processed; `added` new messages were cached.
    Page { added: usize, has_more: bool },
    /// The server cursor expired and this was a fresh query: state was
    /// reset, the stream restarts from scratch.
    Restarted,
}

/// A resumable stream of labeled messages from one inbox.
///
/// Within the stream, messages arrive in server order. The stream ends when
/// the client has caught up to current server state (not the end of the
/// inbox); [`QueryStream::cursor`] then resumes it later from where it
/// stopped. Dropping the stream stops further page fetches.
pub struct QueryStream {
    http: reqwest::Client,
    cache: Arc<dyn CacheStore>,
    locks: Arc<QueryLocks>,
    endpoint: String,
    kind: StreamKind,
    tags: Vec<Vec<u8>>,
    schema: Schema,
    token: Option<String>,
    cache_key: String,
    version: u64,
    num_seen: usize,
    continuation: bool,
    restarted: bool,
    done: bool,
}

impl QueryStream {
    /// The endpoint this stream pages over.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Serialize the current position for a later
    /// [`InboxClient::continue_stream`].
    pub fn cursor(&self) -> Result<String, GraffitiError> {
        ClientCursor {
            cache_key: self.cache_key.clone(),
            version: self.version,
            num_seen: self.num_seen,
            endpoint: self.endpoint.clone(),
            kind: self.kind.path().to_string(),
            tags: self.tags.iter().map(|t| codec::encode_bytes(t)).collect(),
            schema: self.schema.as_value().clone(),
        }
        .encode()
    }

    /// The next message, replaying from cache when possible and refilling
    /// from the server under the advisory lock otherwise. Returns `None`
    /// once caught up to current server state.
    pub async fn next(&mut self) -> Option<Result<LabeledMessage, GraffitiError>> {
        if self.done {
            return None;
        }
        loop {
            let record = match self.load_record() {
                Ok(record) => record,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let record = match self.reconcile_version(record) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            // Replay the cached prefix without the lock.
            if self.num_seen < record.message_ids.len() {
                let id = record.message_ids[self.num_seen].clone();
                self.num_seen += 1;
                let key = message_key(&self.endpoint, &id);
                return Some(match self.cache.get_message(&key) {
                    Ok(Some(message)) => Ok(message),
                    Ok(None) => Err(GraffitiError::Cache(crate::cache::CacheError::Corrupt(
                        format!("message {id} missing from cache"),
                    ))),
                    Err(e) => Err(e.into()),
                });
            }

            // Caught up with the cache: become (or wait for) the refiller.
            let lock = self.locks.for_key(&self.cache_key);
            let guard = lock.lock().await;
            let record = match self.load_record() {
                Ok(record) => record,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let record = match self.reconcile_version(record) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if record.message_ids.len() > self.num_seen {
                // Another reader refilled while we waited; replay.
                drop(guard);
                continue;
            }
            match self.fetch_page(record).await {
                Ok(FetchOutcome::Restarted) => {
                    drop(guard);
                    continue;
                }
                Ok(FetchOutcome::Page { added, has_more }) => {
                    drop(guard);
                    if added == 0 && !has_more {
                        self.done = true;
                        return None;
                    }
                }
                Err(e) => {
                    drop(guard);
                    self.done = !matches!(e, GraffitiError::ProtocolViolation(_));
                    return Some(Err(e));
                }
            }
        }
    }

    fn load_record(&self) -> Result<QueryRecord, GraffitiError> {
        self.cache
            .get_query(&self.cache_key)?
            .ok_or_else(|| GraffitiError::CursorExpired("cached stream state evicted".into()))
    }

    /// Handle a version rotated by another reader: continuations expire,
    /// fresh streams restart their replay from the top.
    fn reconcile_version(
        &mut self,
        record: QueryRecord,
    ) -> Result<Option<QueryRecord>, GraffitiError> {
        if record.version == self.version {
            return Ok(Some(record));
        }
        if self.continuation {
            return Err(GraffitiError::CursorExpired(
                "stream state was rotated behind this cursor".into(),
            ));
        }
        self.version = record.version;
        self.num_seen = 0;
        Ok(None)
    }

    async fn wait_out(&self, record: &QueryRecord) {
        if let Some(wait_til) = record.wait_til {
            let now = now_millis();
            if wait_til > now {
                tokio::time::sleep(Duration::from_millis(wait_til - now)).await;
            }
        }
    }

    /// Fetch one page from the server. Caller holds the advisory lock.
    async fn fetch_page(&mut self, mut record: QueryRecord) -> Result<FetchOutcome, GraffitiError> {
        let mut attempts = 0u32;
        loop {
            self.wait_out(&record).await;

            let mut url = join(&self.endpoint, self.kind.path());
            let body = match &record.cursor {
                Some(cursor) => {
                    url.push_str(&format!("?cursor={}", codec::escape_component(cursor)));
                    Vec::new()
                }
                None => match self.kind {
                    StreamKind::Query => encode_query_body(&self.tags, self.schema.as_value())?,
                    StreamKind::Export => Vec::new(),
                },
            };

            let request = bearer(self.http.post(url), self.token.as_deref())
                .header(reqwest::header::CONTENT_TYPE, CBOR_CONTENT_TYPE)
                .body(body);
            let response = request.send().await?;
            let status = response.status();

            if status == reqwest::StatusCode::GONE {
                return self.handle_expired_cursor();
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                attempts += 1;
                if attempts >= MAX_PAGE_ATTEMPTS {
                    return Err(status_error(status, &format!("query {}", self.endpoint)));
                }
                let delay = retry_after(response.headers()).unwrap_or(DEFAULT_BACKOFF);
                record.wait_til = Some(now_millis() + delay.as_millis() as u64);
                self.cache.put_query(&self.cache_key, &record)?;
                glog!(
                    "query {}: backing off {}s after {}",
                    self.endpoint,
                    delay.as_secs(),
                    status
                );
                continue;
            }
            if !status.is_success() {
                return Err(status_error(status, &format!("query {}", self.endpoint)));
            }

            // A success response may still advise a delay before the next
            // page; persist it so even a restarted process honors it.
            let advised = retry_after(response.headers());
            let page = decode_query_page(&response.bytes().await?)?;

            let mut added = 0usize;
            let mut violation: Option<GraffitiError> = None;
            for message in &page.results {
                if self.kind == StreamKind::Query
                    && !self.schema.matches(&message.message.object.value)
                {
                    glog!(
                        "query {}: server returned {} outside the stated schema",
                        self.endpoint,
                        crate::logging::msg_id(&message.id)
                    );
                    violation.get_or_insert_with(|| {
                        GraffitiError::ProtocolViolation(format!(
                            "message {} does not match the query schema",
                            message.id
                        ))
                    });
                    continue;
                }
                let key = message_key(&self.endpoint, &message.id);
                self.cache.put_message(&key, message)?;
                record.message_ids.push(message.id.clone());
                added += 1;
            }
            if page.cursor.is_some() {
                record.cursor = page.cursor.clone();
            }
            record.wait_til = advised.map(|d| now_millis() + d.as_millis() as u64);
            self.cache.put_query(&self.cache_key, &record)?;

            if let Some(violation) = violation {
                return Err(violation);
            }
            return Ok(FetchOutcome::Page {
                added,
                has_more: page.has_more,
            });
        }
    }

    /// The server-side cursor is gone. Continuations surface the expiry;
    /// fresh queries rotate their version and restart from scratch, once.
    fn handle_expired_cursor(&mut self) -> Result<FetchOutcome, GraffitiError> {
        if self.continuation || self.restarted {
            self.cache.delete_query(&self.cache_key)?;
            return Err(GraffitiError::CursorExpired(format!(
                "server cursor expired for {}",
                self.endpoint
            )));
        }
        self.restarted = true;
        glog!("query {}: server cursor expired, restarting", self.endpoint);
        let record = QueryRecord {
            cursor: None,
            version: rand::rngs::OsRng.next_u64(),
            message_ids: Vec::new(),
            wait_til: None,
        };
        self.cache.put_query(&self.cache_key, &record)?;
        self.version = record.version;
        self.num_seen = 0;
        Ok(FetchOutcome::Restarted)
    }
}
