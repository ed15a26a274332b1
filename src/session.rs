//! Multi-service session management.
//!
//! An actor's identity document lists several services, many of which share
//! an authorization server. The session manager groups services by the
//! authorization endpoint each advertises at `GET /auth`, runs the external
//! authorization flow once per group, and persists the resulting grants as
//! a [`StoredSession`]. Login and logout progress is persisted so a
//! restarted process can tell a half-finished flow from none at all.
//!
//! The per-actor flow is a straight state machine:
//! `logged_out → logging_in → logged_in → logging_out → logged_out`, with
//! progress recorded after each completed group. Concurrent flows for the
//! same actor are rejected.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;
use crate::error::GraffitiError;
use crate::glog;
use crate::identity::{
    IdentityResolver, PERSONAL_INBOX_SERVICE, SHARED_INBOX_SERVICE, STORAGE_BUCKET_SERVICE,
};
use crate::logging;
use crate::transport::fetch_auth_endpoint;

/// Persisted-state key holding the logged-in session list.
pub const SESSIONS_KEY: &str = "graffiti-sessions-logged-in";

/// Persisted-state key holding the one in-flight login record.
pub const LOGIN_IN_PROGRESS_KEY: &str = "graffiti-login-in-progress";

/// Persisted-state key holding the one in-flight logout record.
pub const LOGOUT_IN_PROGRESS_KEY: &str = "graffiti-logout-in-progress";

/// Each authorization group must complete within this window.
pub const AUTH_GROUP_TIMEOUT: Duration = Duration::from_secs(300);

/// In-progress records older than this are considered abandoned.
const FLOW_STALE_MS: u64 = 300_000;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// External authorization component. Produces one bearer token per
/// `(authorization endpoint, actor, service endpoints)` group; the core
/// consumes tokens only and never inspects them.
pub trait Authorizer: Send + Sync {
    fn authorize<'a>(
        &'a self,
        auth_endpoint: &'a str,
        actor: &'a str,
        service_endpoints: &'a [String],
    ) -> BoxFuture<'a, Result<String, GraffitiError>>;

    fn revoke<'a>(
        &'a self,
        auth_endpoint: &'a str,
        actor: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<(), GraffitiError>>;
}

/// One token covering every service endpoint behind one authorization
/// server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub auth_endpoint: String,
    pub token: String,
    pub endpoints: Vec<String>,
}

/// A persisted login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub actor: String,
    pub grants: Vec<TokenGrant>,
}

/// One authenticated service endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSession {
    pub endpoint: String,
    pub token: String,
}

/// A resolved session, ready for the protocol layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub actor: String,
    pub storage_bucket: ServiceSession,
    pub personal_inbox: ServiceSession,
    pub shared_inboxes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FlowRecord {
    actor: String,
    started_at: u64,
    groups_total: usize,
    groups_done: usize,
}

/// Groups services, drives authorization flows, and persists the results.
pub struct SessionManager {
    http: reqwest::Client,
    resolver: Arc<dyn IdentityResolver>,
    authorizer: Arc<dyn Authorizer>,
    store: Arc<dyn CacheStore>,
    active_flows: Mutex<HashSet<String>>,
}

impl SessionManager {
    pub fn new(
        http: reqwest::Client,
        resolver: Arc<dyn IdentityResolver>,
        authorizer: Arc<dyn Authorizer>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        SessionManager {
            http,
            resolver,
            authorizer,
            store,
            active_flows: Mutex::new(HashSet::new()),
        }
    }

    /// Discard abandoned in-progress records. Call at startup; a live
    /// record younger than the staleness window is left for its flow to
    /// resume.
    pub fn sweep_stale_flows(&self) -> Result<(), GraffitiError> {
        for key in [LOGIN_IN_PROGRESS_KEY, LOGOUT_IN_PROGRESS_KEY] {
            if let Some(text) = self.store.get_kv(key)? {
                match serde_json::from_str::<FlowRecord>(&text) {
                    Ok(record) if now_millis().saturating_sub(record.started_at) > FLOW_STALE_MS => {
                        glog!(
                            "session: discarding stale {key} for {}",
                            logging::actor_id(&record.actor)
                        );
                        self.store.delete_kv(key)?;
                    }
                    Ok(_) => {}
                    Err(_) => {
                        self.store.delete_kv(key)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// All persisted sessions.
    pub fn sessions(&self) -> Result<Vec<StoredSession>, GraffitiError> {
        match self.store.get_kv(SESSIONS_KEY)? {
            Some(text) => serde_json::from_str(&text)
                .map_err(|e| crate::cache::CacheError::Serde(e).into()),
            None => Ok(Vec::new()),
        }
    }

    /// The persisted session for one actor, if logged in.
    pub fn session_for(&self, actor: &str) -> Result<Option<StoredSession>, GraffitiError> {
        Ok(self.sessions()?.into_iter().find(|s| s.actor == actor))
    }

    fn write_sessions(&self, sessions: &[StoredSession]) -> Result<(), GraffitiError> {
        let text = serde_json::to_string(sessions).map_err(crate::cache::CacheError::Serde)?;
        self.store.put_kv(SESSIONS_KEY, &text)?;
        Ok(())
    }

    fn begin_flow(&self, actor: &str) -> Result<(), GraffitiError> {
        let mut active = self.active_flows.lock().unwrap();
        if !active.insert(actor.to_string()) {
            return Err(GraffitiError::Forbidden(format!(
                "a login or logout for {actor} is already in progress"
            )));
        }
        Ok(())
    }

    fn end_flow(&self, actor: &str) {
        self.active_flows.lock().unwrap().remove(actor);
    }

    /// Run the full login flow for `actor` and persist the session.
    pub async fn login(&self, actor: &str) -> Result<StoredSession, GraffitiError> {
        self.begin_flow(actor)?;
        let result = self.login_inner(actor).await;
        self.end_flow(actor);
        result
    }

    async fn login_inner(&self, actor: &str) -> Result<StoredSession, GraffitiError> {
        glog!("session: login started for {}", logging::actor_id(actor));
        let doc = self.resolver.resolve(actor).await?;

        // Group every service by the authorization endpoint it advertises.
        // BTreeMap keeps group order stable across runs.
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for service in &doc.services {
            let auth = fetch_auth_endpoint(&self.http, &service.endpoint).await?;
            groups.entry(auth).or_default().push(service.endpoint.clone());
        }

        let mut record = FlowRecord {
            actor: actor.to_string(),
            started_at: now_millis(),
            groups_total: groups.len(),
            groups_done: 0,
        };
        self.put_flow(LOGIN_IN_PROGRESS_KEY, &record)?;

        let mut grants = Vec::with_capacity(groups.len());
        for (auth_endpoint, endpoints) in &groups {
            let token = tokio::time::timeout(
                AUTH_GROUP_TIMEOUT,
                self.authorizer.authorize(auth_endpoint, actor, endpoints),
            )
            .await
            .map_err(|_| {
                GraffitiError::Transport(format!("authorization timed out for {auth_endpoint}"))
            })??;
            grants.push(TokenGrant {
                auth_endpoint: auth_endpoint.clone(),
                token,
                endpoints: endpoints.clone(),
            });
            record.groups_done += 1;
            self.put_flow(LOGIN_IN_PROGRESS_KEY, &record)?;
            glog!(
                "session: auth group {}/{} complete for {}",
                record.groups_done,
                record.groups_total,
                logging::actor_id(actor)
            );
        }

        let session = StoredSession {
            actor: actor.to_string(),
            grants,
        };
        let mut sessions = self.sessions()?;
        sessions.retain(|s| s.actor != actor);
        sessions.push(session.clone());
        self.write_sessions(&sessions)?;
        self.store.delete_kv(LOGIN_IN_PROGRESS_KEY)?;
        glog!("session: login complete for {}", logging::actor_id(actor));
        Ok(session)
    }

    /// Revoke every grant and drop the persisted session. Revocation is
    /// best-effort per group; a failed revoke is logged and the logout
    /// proceeds.
    pub async fn logout(&self, actor: &str) -> Result<(), GraffitiError> {
        self.begin_flow(actor)?;
        let result = self.logout_inner(actor).await;
        self.end_flow(actor);
        result
    }

    async fn logout_inner(&self, actor: &str) -> Result<(), GraffitiError> {
        let session = self
            .session_for(actor)?
            .ok_or_else(|| GraffitiError::NotFound(format!("{actor} is not logged in")))?;
        glog!("session: logout started for {}", logging::actor_id(actor));

        let mut record = FlowRecord {
            actor: actor.to_string(),
            started_at: now_millis(),
            groups_total: session.grants.len(),
            groups_done: 0,
        };
        self.put_flow(LOGOUT_IN_PROGRESS_KEY, &record)?;

        for grant in &session.grants {
            let revoked = tokio::time::timeout(
                AUTH_GROUP_TIMEOUT,
                self.authorizer
                    .revoke(&grant.auth_endpoint, actor, &grant.token),
            )
            .await;
            match revoked {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    glog!("session: revoke failed for {}: {e}", grant.auth_endpoint);
                }
                Err(_) => {
                    glog!("session: revoke timed out for {}", grant.auth_endpoint);
                }
            }
            record.groups_done += 1;
            self.put_flow(LOGOUT_IN_PROGRESS_KEY, &record)?;
        }

        let mut sessions = self.sessions()?;
        sessions.retain(|s| s.actor != actor);
        self.write_sessions(&sessions)?;
        self.store.delete_kv(LOGOUT_IN_PROGRESS_KEY)?;
        glog!("session: logout complete for {}", logging::actor_id(actor));
        Ok(())
    }

    /// Resolve a stored session into the rich per-service token map the
    /// protocol layer consumes.
    pub async fn resolve_session(&self, stored: &StoredSession) -> Result<Session, GraffitiError> {
        let doc = self.resolver.resolve(&stored.actor).await?;
        let mut tokens: HashMap<&str, &str> = HashMap::new();
        for grant in &stored.grants {
            for endpoint in &grant.endpoints {
                tokens.insert(endpoint.as_str(), grant.token.as_str());
            }
        }

        let lookup = |kind: &str| -> Result<ServiceSession, GraffitiError> {
            let endpoint = doc.service_endpoint(kind).ok_or_else(|| {
                GraffitiError::NotFound(format!("{} lists no {kind} service", stored.actor))
            })?;
            let token = tokens.get(endpoint).ok_or_else(|| {
                GraffitiError::Unauthorized(format!("no token covers {endpoint}"))
            })?;
            Ok(ServiceSession {
                endpoint: endpoint.to_string(),
                token: token.to_string(),
            })
        };

        Ok(Session {
            actor: stored.actor.clone(),
            storage_bucket: lookup(STORAGE_BUCKET_SERVICE)?,
            personal_inbox: lookup(PERSONAL_INBOX_SERVICE)?,
            shared_inboxes: doc.service_endpoints(SHARED_INBOX_SERVICE),
        })
    }

    fn put_flow(&self, key: &str, record: &FlowRecord) -> Result<(), GraffitiError> {
        let text = serde_json::to_string(record).map_err(crate::cache::CacheError::Serde)?;
        self.store.put_kv(key, &text)?;
        Ok(())
    }
}
