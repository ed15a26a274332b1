//! Top-level client facade.
//!
//! Wires the configuration, identity resolver, authorizer, cache, and
//! transport into one handle exposing the protocol flows: `post`, `get`,
//! `delete`, `discover`, and session management.

use std::sync::Arc;

use crate::announce::{random_bucket_key, Announcer};
use crate::bucket::BucketClient;
use crate::cache::{CacheStore, MemoryCache};
use crate::config::ClientConfig;
use crate::discover::{Discovery, DiscoverStream};
use crate::error::GraffitiError;
use crate::glog;
use crate::identity::IdentityResolver;
use crate::inbox::InboxClient;
use crate::logging;
use crate::protocol::{encode_object, Object, PartialObject};
use crate::schema::Schema;
use crate::session::{Authorizer, Session, SessionManager, StoredSession};

/// Builder for [`GraffitiClient`].
pub struct GraffitiClientBuilder {
    config: ClientConfig,
    resolver: Arc<dyn IdentityResolver>,
    authorizer: Arc<dyn Authorizer>,
    cache: Option<Arc<dyn CacheStore>>,
}

impl GraffitiClientBuilder {
    pub fn new(resolver: Arc<dyn IdentityResolver>, authorizer: Arc<dyn Authorizer>) -> Self {
        GraffitiClientBuilder {
            config: ClientConfig::default(),
            resolver,
            authorizer,
            cache: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific cache backend; defaults to an in-memory cache.
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<GraffitiClient, GraffitiError> {
        let http = crate::transport::client()?;
        let cache = self.cache.unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let inbox = InboxClient::new(http.clone(), cache.clone());
        let bucket = BucketClient::new(http.clone());
        let announcer = Announcer::new(inbox.clone(), bucket.clone(), self.resolver.clone());
        let discovery = Discovery::new(
            inbox.clone(),
            bucket.clone(),
            self.resolver.clone(),
            announcer.clone(),
            self.config.default_inbox_endpoints.clone(),
        );
        let sessions = SessionManager::new(
            http.clone(),
            self.resolver.clone(),
            self.authorizer,
            cache.clone(),
        );
        sessions.sweep_stale_flows()?;
        Ok(GraffitiClient {
            inbox,
            bucket,
            announcer,
            discovery,
            sessions,
        })
    }
}

/// The protocol-layer client.
pub struct GraffitiClient {
    inbox: InboxClient,
    bucket: BucketClient,
    announcer: Announcer,
    discovery: Discovery,
    sessions: SessionManager,
}

impl GraffitiClient {
    pub fn builder(
        resolver: Arc<dyn IdentityResolver>,
        authorizer: Arc<dyn Authorizer>,
    ) -> GraffitiClientBuilder {
        GraffitiClientBuilder::new(resolver, authorizer)
    }

    /// Post an object: encode it, store the envelope in the session's
    /// bucket, and announce it. Partial delivery failures are logged; the
    /// post succeeds once the self-announcement lands.
    pub async fn post(
        &self,
        partial: &PartialObject,
        session: &Session,
    ) -> Result<Object, GraffitiError> {
        let encoded = encode_object(partial, &session.actor)?;
        let key = random_bucket_key();
        let outcome = self
            .announcer
            .announce(
                session,
                &encoded.object,
                &encoded.tags,
                encoded.allowed_tickets.as_deref(),
                &key,
                Some(&encoded.bytes),
                None,
            )
            .await?;
        glog!(
            "post: {} announced by {}",
            logging::msg_id(&outcome.self_message_id),
            logging::actor_id(&session.actor)
        );
        Ok(encoded.object)
    }

    /// Fetch one object by URL.
    pub async fn get(
        &self,
        url: &str,
        schema: &Schema,
        session: Option<&Session>,
    ) -> Result<Object, GraffitiError> {
        self.discovery.get(url, schema, session).await
    }

    /// Delete an object we authored.
    pub async fn delete(&self, url: &str, session: &Session) -> Result<(), GraffitiError> {
        self.discovery.delete(url, session).await
    }

    /// Open a merged discovery stream over the given channels.
    pub async fn discover(
        &self,
        channels: &[String],
        schema: &Schema,
        session: Option<&Session>,
    ) -> Result<DiscoverStream, GraffitiError> {
        self.discovery.discover(channels, schema, session).await
    }

    /// Resume a discovery stream from a serialized cursor.
    pub async fn continue_discover(
        &self,
        cursor: &str,
        session: Option<&Session>,
    ) -> Result<DiscoverStream, GraffitiError> {
        self.discovery.continue_discover(cursor, session).await
    }

    /// Log an actor in and persist the session.
    pub async fn login(&self, actor: &str) -> Result<StoredSession, GraffitiError> {
        self.sessions.login(actor).await
    }

    /// Log an actor out, revoking its grants best-effort.
    pub async fn logout(&self, actor: &str) -> Result<(), GraffitiError> {
        self.sessions.logout(actor).await
    }

    /// Resolve a stored session for use with the protocol flows.
    pub async fn resolve_session(&self, stored: &StoredSession) -> Result<Session, GraffitiError> {
        self.sessions.resolve_session(stored).await
    }

    /// The session manager, for direct flow control.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The inbox client, for direct message-level access.
    pub fn inbox(&self) -> &InboxClient {
        &self.inbox
    }

    /// The bucket client, for direct value-level access.
    pub fn bucket(&self) -> &BucketClient {
        &self.bucket
    }
}
