//! Identity documents and the resolution seam.
//!
//! Actors are opaque decentralized identifiers (`did:web:…`, `did:plc:…`).
//! Resolving an actor to its service endpoints and equivalent identifiers
//! is an external collaborator's job; the protocol layer consumes it
//! through [`IdentityResolver`] and never performs it itself.
//! [`StaticResolver`] covers tests and fixed deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::GraffitiError;

/// Service type naming an actor's storage bucket.
pub const STORAGE_BUCKET_SERVICE: &str = "StorageBucket";

/// Service type naming an actor's personal inbox.
pub const PERSONAL_INBOX_SERVICE: &str = "PersonalInbox";

/// Service type naming a shared inbox the actor announces public posts to.
pub const SHARED_INBOX_SERVICE: &str = "SharedInbox";

/// One service entry in an identity document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub endpoint: String,
}

/// A resolved identity: services plus equivalent identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub actor: String,
    pub services: Vec<Service>,
    #[serde(default)]
    pub also_known_as: Vec<String>,
}

impl IdentityDocument {
    /// The first service endpoint of the given type, if any.
    pub fn service_endpoint(&self, kind: &str) -> Option<&str> {
        self.services
            .iter()
            .find(|service| service.kind == kind)
            .map(|service| service.endpoint.as_str())
    }

    /// Every service endpoint of the given type, in document order.
    pub fn service_endpoints(&self, kind: &str) -> Vec<String> {
        self.services
            .iter()
            .filter(|service| service.kind == kind)
            .map(|service| service.endpoint.clone())
            .collect()
    }
}

/// Read-only actor lookup. The returned document reflects whatever the
/// resolution layer currently knows; the core never caches it.
pub trait IdentityResolver: Send + Sync {
    fn resolve<'a>(&'a self, actor: &'a str) -> BoxFuture<'a, Result<IdentityDocument, GraffitiError>>;
}

/// Resolver over a fixed set of documents.
#[derive(Default)]
pub struct StaticResolver {
    docs: Mutex<HashMap<String, IdentityDocument>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        StaticResolver::default()
    }

    pub fn insert(&self, doc: IdentityDocument) {
        self.docs.lock().unwrap().insert(doc.actor.clone(), doc);
    }
}

impl IdentityResolver for StaticResolver {
    fn resolve<'a>(&'a self, actor: &'a str) -> BoxFuture<'a, Result<IdentityDocument, GraffitiError>> {
        Box::pin(async move {
            self.docs
                .lock()
                .unwrap()
                .get(actor)
                .cloned()
                .ok_or_else(|| GraffitiError::NotFound(format!("no identity document for {actor}")))
        })
    }
}
