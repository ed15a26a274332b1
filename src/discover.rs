//! Discovery pipeline: `get`, `delete`, and the merged multi-inbox
//! `discover` stream.
//!
//! Every inbox stream goes through the same per-message pipeline: dropped
//! if already labeled trash or invalid, trusted if the server vouches it
//! valid, and otherwise lazily validated by fetching the envelope bytes
//! from the author's bucket, checking them cryptographically, and
//! relabeling the message valid or invalid for the next reader. A bucket
//! miss on a message that carries a tombstone reference is the tombstone
//! confirming itself.
//!
//! `discover` fans out over the whole inbox set, racing the per-endpoint
//! pipelines so a slow endpoint never blocks the rest, deduping objects by
//! URL, and letting tombstones win over live copies regardless of arrival
//! order. The merged stream has no global order; callers must be
//! idempotent with respect to interleaving.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt as _};
use serde::{Deserialize, Serialize};

use crate::announce::{Announcer, PriorAnnouncements};
use crate::bucket::BucketClient;
use crate::codec;
use crate::crypto::channel_public_id;
use crate::error::GraffitiError;
use crate::glog;
use crate::identity::{IdentityResolver, STORAGE_BUCKET_SERVICE};
use crate::inbox::{InboxClient, QueryStream};
use crate::logging;
use crate::protocol::{
    decode_object_url, url_tag, Label, LabeledMessage, MessageMeta, Object, PrivateInfo,
    MAX_OBJECT_SIZE_BYTES,
};
use crate::schema::Schema;
use crate::session::Session;

/// One item of a merged discovery stream.
#[derive(Debug)]
pub enum DiscoverItem {
    /// A validated object, its channels filtered to the queried subset.
    Object(Object),
    /// The object at `url` was deleted.
    Tombstone { url: String },
    /// One endpoint failed; the stream continues with the others.
    EndpointError {
        origin: String,
        error: GraffitiError,
    },
}

/// What one endpoint pipeline produced.
enum Processed {
    Object { object: Object, tags: Vec<Vec<u8>> },
    Tombstone { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UrlState {
    Live,
    Tombstoned,
}

/// Serialized multi-endpoint position: the queried channels plus one inbox
/// cursor per endpoint that completed cleanly.
#[derive(Debug, Serialize, Deserialize)]
struct DiscoverCursor {
    channels: Vec<String>,
    cursors: BTreeMap<String, String>,
}

/// get/delete/discover over a session's inbox set.
#[derive(Clone)]
pub struct Discovery {
    inbox: InboxClient,
    bucket: BucketClient,
    resolver: Arc<dyn IdentityResolver>,
    announcer: Announcer,
    default_inboxes: Vec<String>,
}

impl Discovery {
    pub fn new(
        inbox: InboxClient,
        bucket: BucketClient,
        resolver: Arc<dyn IdentityResolver>,
        announcer: Announcer,
        default_inboxes: Vec<String>,
    ) -> Self {
        Discovery {
            inbox,
            bucket,
            resolver,
            announcer,
            default_inboxes,
        }
    }

    /// The inboxes a read fans out over: the session's personal and shared
    /// inboxes when logged in, the configured public defaults otherwise.
    fn inbox_set(&self, session: Option<&Session>) -> Vec<(String, Option<String>)> {
        match session {
            Some(session) => {
                let mut set = vec![(
                    session.personal_inbox.endpoint.clone(),
                    Some(session.personal_inbox.token.clone()),
                )];
                for endpoint in &session.shared_inboxes {
                    if endpoint != &session.personal_inbox.endpoint {
                        set.push((endpoint.clone(), None));
                    }
                }
                set
            }
            None => self
                .default_inboxes
                .iter()
                .map(|endpoint| (endpoint.clone(), None))
                .collect(),
        }
    }

    fn token_for(&self, endpoint: &str, session: Option<&Session>) -> Option<String> {
        session
            .filter(|s| s.personal_inbox.endpoint == endpoint)
            .map(|s| s.personal_inbox.token.clone())
    }

    fn pipe(&self, endpoint: String, token: Option<String>, stream: QueryStream) -> EndpointPipe {
        EndpointPipe {
            endpoint,
            token,
            stream,
            inbox: self.inbox.clone(),
            bucket: self.bucket.clone(),
            resolver: self.resolver.clone(),
        }
    }

    /// Fetch one object by URL, reducing each inbox's view to the last
    /// non-tombstoned copy. A tombstone anywhere is final. The caller's
    /// schema is checked on the reduced hit.
    pub async fn get(
        &self,
        url: &str,
        schema: &Schema,
        session: Option<&Session>,
    ) -> Result<Object, GraffitiError> {
        decode_object_url(url)?;

        let mut saw_mismatch = false;
        for (endpoint, token) in self.inbox_set(session) {
            let stream = self
                .inbox
                .query(&endpoint, vec![url_tag(url)], Schema::any(), token.as_deref())
                .await?;
            let mut pipe = self.pipe(endpoint.clone(), token, stream);

            let mut found: Option<Object> = None;
            loop {
                let (returned, item) = pipe.advance().await;
                pipe = returned;
                match item {
                    None => break,
                    Some(Err(error)) => {
                        glog!("get: {endpoint} failed mid-stream: {error}");
                        break;
                    }
                    Some(Ok(Processed::Tombstone { url: gone })) if gone == url => {
                        return Err(GraffitiError::NotFound(format!("{url} was deleted")));
                    }
                    Some(Ok(Processed::Tombstone { .. })) => {}
                    Some(Ok(Processed::Object { object, .. })) if object.url == url => {
                        found = Some(object);
                    }
                    Some(Ok(Processed::Object { .. })) => {}
                }
            }

            if let Some(object) = found {
                if schema.matches(&object.value) {
                    return Ok(object);
                }
                saw_mismatch = true;
            }
        }

        if saw_mismatch {
            Err(GraffitiError::SchemaMismatch(format!(
                "{url} fails the caller's schema"
            )))
        } else {
            Err(GraffitiError::NotFound(url.to_string()))
        }
    }

    /// Delete an object we authored: remove the bucket value and re-announce
    /// as a tombstone naming every prior message.
    pub async fn delete(&self, url: &str, session: &Session) -> Result<(), GraffitiError> {
        let (actor, _) = decode_object_url(url)?;
        if actor != session.actor {
            // Rejected before any network call.
            return Err(GraffitiError::Forbidden(format!(
                "{} cannot delete an object authored by {}",
                session.actor, actor
            )));
        }

        // Locate our self-copy via the URL tag.
        let mut stream = self
            .inbox
            .query(
                &session.personal_inbox.endpoint,
                vec![url_tag(url)],
                Schema::any(),
                Some(&session.personal_inbox.token),
            )
            .await?;
        let mut found: Option<LabeledMessage> = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(labeled) => {
                    if labeled.message.object.url == url
                        && matches!(labeled.message.parse_meta(), Ok(MessageMeta::Owner { .. }))
                    {
                        found = Some(labeled);
                    }
                }
                Err(error) if error.is_violation() => continue,
                Err(error) => return Err(error),
            }
        }
        let labeled =
            found.ok_or_else(|| GraffitiError::NotFound(format!("no self-copy of {url}")))?;
        let MessageMeta::Owner {
            base,
            tickets,
            receipts,
        } = labeled.message.parse_meta()?
        else {
            return Err(GraffitiError::ProtocolViolation(
                "self-copy metadata is not the owner form".into(),
            ));
        };
        if base.tombstone_of.is_some() {
            return Err(GraffitiError::NotFound(format!("{url} is already deleted")));
        }

        match self
            .bucket
            .delete(
                &session.storage_bucket.endpoint,
                &base.bucket_key,
                &session.storage_bucket.token,
            )
            .await
        {
            Ok(()) => {}
            Err(GraffitiError::NotFound(_)) => {
                glog!("delete: bucket value for {url} already gone");
            }
            Err(error) => return Err(error),
        }

        let object = labeled.message.object.clone();
        let tags: Vec<Vec<u8>> = object
            .channels
            .iter()
            .map(|channel| channel_public_id(channel).to_vec())
            .collect();
        let prior = PriorAnnouncements {
            self_id: labeled.id.clone(),
            receipts,
        };
        self.announcer
            .announce(
                session,
                &object,
                &tags,
                tickets.as_deref(),
                &base.bucket_key,
                None,
                Some(&prior),
            )
            .await?;
        glog!(
            "delete: tombstoned {} ({})",
            url,
            logging::msg_id(&labeled.id)
        );
        Ok(())
    }

    /// Open a merged stream over every inbox, filtered by channel tags.
    pub async fn discover(
        &self,
        channels: &[String],
        schema: &Schema,
        session: Option<&Session>,
    ) -> Result<DiscoverStream, GraffitiError> {
        let requested: Vec<(String, Vec<u8>)> = channels
            .iter()
            .map(|channel| (channel.clone(), channel_public_id(channel).to_vec()))
            .collect();
        let tags: Vec<Vec<u8>> = requested.iter().map(|(_, tag)| tag.clone()).collect();

        let mut pending = FuturesUnordered::new();
        for (endpoint, token) in self.inbox_set(session) {
            let stream = self
                .inbox
                .query(&endpoint, tags.clone(), schema.clone(), token.as_deref())
                .await?;
            let pipe = self.pipe(endpoint, token, stream);
            pending.push(pipe.advance());
        }

        Ok(DiscoverStream {
            pending,
            pre_errors: Vec::new(),
            requested,
            channels: channels.to_vec(),
            states: HashMap::new(),
            cursors: BTreeMap::new(),
            continuation_single: None,
            done: false,
        })
    }

    /// Re-enter a discovery stream from a serialized cursor. A stale inbox
    /// cursor yields one `EndpointError` for that endpoint while the others
    /// proceed; it surfaces as an error only when the continuation covered
    /// that endpoint alone.
    pub async fn continue_discover(
        &self,
        cursor: &str,
        session: Option<&Session>,
    ) -> Result<DiscoverStream, GraffitiError> {
        let bytes = codec::decode_bytes(cursor)
            .map_err(|e| GraffitiError::CursorExpired(format!("undecodable cursor: {e}")))?;
        let parsed: DiscoverCursor = serde_json::from_slice(&bytes)
            .map_err(|e| GraffitiError::CursorExpired(format!("undecodable cursor: {e}")))?;

        let requested: Vec<(String, Vec<u8>)> = parsed
            .channels
            .iter()
            .map(|channel| (channel.clone(), channel_public_id(channel).to_vec()))
            .collect();

        let single = if parsed.cursors.len() == 1 {
            parsed.cursors.keys().next().cloned()
        } else {
            None
        };

        let mut pending = FuturesUnordered::new();
        let mut pre_errors = Vec::new();
        for (endpoint, inbox_cursor) in &parsed.cursors {
            let token = self.token_for(endpoint, session);
            match self
                .inbox
                .continue_stream(inbox_cursor, token.as_deref())
                .await
            {
                Ok(stream) => {
                    let pipe = self.pipe(endpoint.clone(), token, stream);
                    pending.push(pipe.advance());
                }
                Err(error) => pre_errors.push((endpoint.clone(), error)),
            }
        }

        Ok(DiscoverStream {
            pending,
            pre_errors,
            requested,
            channels: parsed.channels,
            states: HashMap::new(),
            cursors: BTreeMap::new(),
            continuation_single: single,
            done: false,
        })
    }
}

type PipeFuture = BoxFuture<'static, (EndpointPipe, Option<Result<Processed, GraffitiError>>)>;

/// A merged, unordered stream of validated objects and tombstones.
pub struct DiscoverStream {
    pending: FuturesUnordered<PipeFuture>,
    pre_errors: Vec<(String, GraffitiError)>,
    requested: Vec<(String, Vec<u8>)>,
    channels: Vec<String>,
    states: HashMap<String, UrlState>,
    cursors: BTreeMap<String, String>,
    continuation_single: Option<String>,
    done: bool,
}

impl DiscoverStream {
    /// The next merged item. Objects are deduped by URL; a tombstone is
    /// yielded at most once per URL and suppresses later live copies.
    /// Returns `None` when every endpoint has caught up.
    pub async fn next(&mut self) -> Option<Result<DiscoverItem, GraffitiError>> {
        if self.done {
            return None;
        }

        if let Some((origin, error)) = self.pre_errors.pop() {
            if self.continuation_single.as_deref() == Some(origin.as_str())
                && matches!(error, GraffitiError::CursorExpired(_))
            {
                self.done = true;
                return Some(Err(error));
            }
            return Some(Ok(DiscoverItem::EndpointError { origin, error }));
        }

        while let Some((pipe, item)) = self.pending.next().await {
            match item {
                None => {
                    match pipe.stream.cursor() {
                        Ok(cursor) => {
                            self.cursors.insert(pipe.endpoint.clone(), cursor);
                        }
                        Err(error) => {
                            glog!("discover: no cursor for {}: {error}", pipe.endpoint);
                        }
                    }
                    continue;
                }
                Some(Err(error)) => {
                    let origin = pipe.endpoint.clone();
                    if !matches!(error, GraffitiError::CursorExpired(_)) {
                        if let Ok(cursor) = pipe.stream.cursor() {
                            self.cursors.insert(origin.clone(), cursor);
                        }
                    }
                    if self.continuation_single.as_deref() == Some(origin.as_str())
                        && matches!(error, GraffitiError::CursorExpired(_))
                    {
                        self.done = true;
                        return Some(Err(error));
                    }
                    self.done = self.pending.is_empty();
                    return Some(Ok(DiscoverItem::EndpointError { origin, error }));
                }
                Some(Ok(processed)) => {
                    let origin = pipe.endpoint.clone();
                    self.pending.push(pipe.advance());
                    match processed {
                        Processed::Tombstone { url } => {
                            if self.states.get(&url) == Some(&UrlState::Tombstoned) {
                                continue;
                            }
                            self.states.insert(url.clone(), UrlState::Tombstoned);
                            return Some(Ok(DiscoverItem::Tombstone { url }));
                        }
                        Processed::Object { mut object, tags } => {
                            if self.states.contains_key(&object.url) {
                                // Duplicate announcement or already
                                // tombstoned; either way it was yielded.
                                continue;
                            }
                            let matched: Vec<String> = self
                                .requested
                                .iter()
                                .filter(|(_, tag)| tags.contains(tag))
                                .map(|(channel, _)| channel.clone())
                                .collect();
                            if matched.is_empty() {
                                return Some(Ok(DiscoverItem::EndpointError {
                                    origin,
                                    error: GraffitiError::ProtocolViolation(format!(
                                        "{} matched none of the queried channels",
                                        object.url
                                    )),
                                }));
                            }
                            object.channels = matched;
                            self.states.insert(object.url.clone(), UrlState::Live);
                            return Some(Ok(DiscoverItem::Object(object)));
                        }
                    }
                }
            }
        }

        self.done = true;
        None
    }

    /// Serialize the multi-endpoint position. Complete once the stream has
    /// been drained; endpoints that failed are omitted.
    pub fn cursor(&self) -> Result<String, GraffitiError> {
        let cursor = DiscoverCursor {
            channels: self.channels.clone(),
            cursors: self.cursors.clone(),
        };
        let json = serde_json::to_vec(&cursor).map_err(crate::cache::CacheError::Serde)?;
        Ok(codec::encode_bytes(&json))
    }
}

// ---------------------------------------------------------------------------
// Per-endpoint pipeline
// ---------------------------------------------------------------------------

/// One inbox stream plus everything needed to validate its messages.
struct EndpointPipe {
    endpoint: String,
    token: Option<String>,
    stream: QueryStream,
    inbox: InboxClient,
    bucket: BucketClient,
    resolver: Arc<dyn IdentityResolver>,
}

impl EndpointPipe {
    /// Produce the next validated item, owning `self` through the await so
    /// the caller can race pipes in a `FuturesUnordered`.
    fn advance(mut self) -> PipeFuture {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    None => return (self, None),
                    Some(Err(error)) if error.is_violation() => {
                        // A single message outside the schema; already
                        // logged by the stream. Skip it, keep going.
                        continue;
                    }
                    Some(Err(error)) => return (self, Some(Err(error))),
                    Some(Ok(labeled)) => match self.process(labeled).await {
                        Some(processed) => return (self, Some(Ok(processed))),
                        None => continue,
                    },
                }
            }
        })
    }

    /// Best-effort relabel: local cache always, wire when we hold a token.
    async fn relabel(&self, id: &str, label: Label) {
        if let Err(error) = self
            .inbox
            .label(&self.endpoint, id, label, self.token.as_deref())
            .await
        {
            glog!(
                "discover: relabel of {} failed: {error}",
                logging::msg_id(id)
            );
        }
    }

    /// The per-message matrix: drop trash/invalid, trust valid, lazily
    /// validate unlabeled.
    async fn process(&self, labeled: LabeledMessage) -> Option<Processed> {
        match labeled.label {
            Label::Trash | Label::Invalid => return None,
            Label::Valid => {
                // Server-vouched; yield directly.
                return Some(Processed::Object {
                    object: labeled.message.object.clone(),
                    tags: labeled.message.tags.clone(),
                });
            }
            Label::Unlabeled => {}
        }

        let meta = match labeled.message.parse_meta() {
            Ok(meta) => meta,
            Err(error) => {
                glog!(
                    "discover: unparsable metadata on {}: {error}",
                    logging::msg_id(&labeled.id)
                );
                self.relabel(&labeled.id, Label::Invalid).await;
                return None;
            }
        };
        let object = &labeled.message.object;

        // Fetch the envelope from the author's bucket.
        let doc = match self.resolver.resolve(&object.actor).await {
            Ok(doc) => doc,
            Err(error) => {
                glog!(
                    "discover: cannot resolve {}: {error}",
                    logging::actor_id(&object.actor)
                );
                self.relabel(&labeled.id, Label::Invalid).await;
                return None;
            }
        };
        let Some(bucket_endpoint) = doc.service_endpoint(STORAGE_BUCKET_SERVICE) else {
            self.relabel(&labeled.id, Label::Invalid).await;
            return None;
        };

        let fetched = self
            .bucket
            .get(
                bucket_endpoint,
                &meta.base().bucket_key,
                Some(MAX_OBJECT_SIZE_BYTES),
            )
            .await;

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(GraffitiError::NotFound(_)) if meta.base().tombstone_of.is_some() => {
                // The bucket value is gone and the message says it should
                // be: the tombstone is correct.
                return Some(self.confirm_tombstone(&labeled, &meta).await);
            }
            Err(error) => {
                glog!(
                    "discover: bucket fetch for {} failed: {error}",
                    logging::msg_id(&labeled.id)
                );
                self.relabel(&labeled.id, Label::Invalid).await;
                return None;
            }
        };

        let valid = match &meta {
            MessageMeta::Shared { .. } => crate::protocol::validate_object(
                &object.url,
                &object.value,
                &labeled.message.tags,
                &bytes,
                None,
            ),
            MessageMeta::Owner { tickets, .. } => match (&object.allowed, tickets) {
                (Some(recipients), Some(tickets)) => crate::protocol::validate_object(
                    &object.url,
                    &object.value,
                    &labeled.message.tags,
                    &bytes,
                    Some(PrivateInfo::Owner {
                        recipients,
                        tickets,
                    }),
                ),
                (None, None) => crate::protocol::validate_object(
                    &object.url,
                    &object.value,
                    &labeled.message.tags,
                    &bytes,
                    None,
                ),
                _ => Err(GraffitiError::ProtocolViolation(
                    "owner metadata disagrees with object visibility".into(),
                )),
            },
            MessageMeta::Recipient { ticket, index, .. } => {
                match object.allowed.as_ref().and_then(|a| a.first()) {
                    Some(recipient) => crate::protocol::validate_object(
                        &object.url,
                        &object.value,
                        &labeled.message.tags,
                        &bytes,
                        Some(PrivateInfo::Recipient {
                            recipient,
                            ticket,
                            index: *index as usize,
                        }),
                    ),
                    None => Err(GraffitiError::ProtocolViolation(
                        "recipient delivery without a masked allowed list".into(),
                    )),
                }
            }
        };

        match valid {
            Ok(()) => {
                self.relabel(&labeled.id, Label::Valid).await;
                Some(Processed::Object {
                    object: object.clone(),
                    tags: labeled.message.tags.clone(),
                })
            }
            Err(error) => {
                glog!(
                    "discover: {} failed validation: {error}",
                    logging::msg_id(&labeled.id)
                );
                self.relabel(&labeled.id, Label::Invalid).await;
                None
            }
        }
    }

    /// A confirmed tombstone: trash it, trash the message it references
    /// when that names the same URL, and yield the tombstone.
    async fn confirm_tombstone(&self, labeled: &LabeledMessage, meta: &MessageMeta) -> Processed {
        let url = labeled.message.object.url.clone();
        self.relabel(&labeled.id, Label::Trash).await;
        if let Some(prior_id) = &meta.base().tombstone_of {
            match self
                .inbox
                .get(&self.endpoint, prior_id, self.token.as_deref())
                .await
            {
                Ok(prior) if prior.message.object.url == url => {
                    self.relabel(prior_id, Label::Trash).await;
                }
                Ok(_) => {}
                Err(error) => {
                    glog!(
                        "discover: prior message {} unavailable: {error}",
                        logging::msg_id(prior_id)
                    );
                }
            }
        }
        Processed::Tombstone { url }
    }
}
