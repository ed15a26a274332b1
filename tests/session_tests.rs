//! Session-manager tests: service grouping, persisted sessions, and the
//! login/logout state machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

use graffiti::cache::{CacheStore, MemoryCache};
use graffiti::error::GraffitiError;
use graffiti::identity::{
    IdentityDocument, Service, StaticResolver, PERSONAL_INBOX_SERVICE, SHARED_INBOX_SERVICE,
    STORAGE_BUCKET_SERVICE,
};
use graffiti::session::{
    Authorizer, SessionManager, LOGIN_IN_PROGRESS_KEY, SESSIONS_KEY,
};

/// A service endpoint that only advertises its authorization endpoint.
async fn start_service(auth_endpoint: String) -> (String, oneshot::Sender<()>) {
    let app = Router::new().route(
        "/auth",
        get(move || {
            let auth = auth_endpoint.clone();
            async move { auth }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind service");
    let addr = listener.local_addr().expect("service addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });
    (format!("http://{}", addr), shutdown_tx)
}

#[derive(Default)]
struct RecordingAuthorizer {
    authorized: Mutex<Vec<(String, String, Vec<String>)>>,
    revoked: Mutex<Vec<(String, String)>>,
    counter: AtomicUsize,
    /// When set, `authorize` parks until the watch fires.
    gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
}

impl Authorizer for RecordingAuthorizer {
    fn authorize<'a>(
        &'a self,
        auth_endpoint: &'a str,
        actor: &'a str,
        service_endpoints: &'a [String],
    ) -> BoxFuture<'a, Result<String, GraffitiError>> {
        Box::pin(async move {
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.authorized.lock().unwrap().push((
                auth_endpoint.to_string(),
                actor.to_string(),
                service_endpoints.to_vec(),
            ));
            Ok(format!("token-{}", self.counter.fetch_add(1, Ordering::SeqCst)))
        })
    }

    fn revoke<'a>(
        &'a self,
        auth_endpoint: &'a str,
        _actor: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<(), GraffitiError>> {
        Box::pin(async move {
            self.revoked
                .lock()
                .unwrap()
                .push((auth_endpoint.to_string(), token.to_string()));
            Ok(())
        })
    }
}

struct Fixture {
    manager: Arc<SessionManager>,
    authorizer: Arc<RecordingAuthorizer>,
    store: Arc<MemoryCache>,
    bucket_url: String,
    inbox_url: String,
    shared_url: String,
    _guards: Vec<oneshot::Sender<()>>,
}

/// Three services for one actor; the bucket and personal inbox share an
/// authorization server, the shared inbox has its own.
async fn fixture() -> Fixture {
    let (bucket_url, g1) = start_service("https://auth-one.test".into()).await;
    let (inbox_url, g2) = start_service("https://auth-one.test".into()).await;
    let (shared_url, g3) = start_service("https://auth-two.test".into()).await;

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert(IdentityDocument {
        actor: "did:web:a.test".into(),
        services: vec![
            Service {
                id: "did:web:a.test#bucket".into(),
                kind: STORAGE_BUCKET_SERVICE.into(),
                endpoint: bucket_url.clone(),
            },
            Service {
                id: "did:web:a.test#inbox".into(),
                kind: PERSONAL_INBOX_SERVICE.into(),
                endpoint: inbox_url.clone(),
            },
            Service {
                id: "did:web:a.test#shared".into(),
                kind: SHARED_INBOX_SERVICE.into(),
                endpoint: shared_url.clone(),
            },
        ],
        also_known_as: vec![],
    });

    let authorizer = Arc::new(RecordingAuthorizer::default());
    let store = Arc::new(MemoryCache::new());
    let manager = Arc::new(SessionManager::new(
        reqwest::Client::new(),
        resolver,
        authorizer.clone(),
        store.clone(),
    ));
    Fixture {
        manager,
        authorizer,
        store,
        bucket_url,
        inbox_url,
        shared_url,
        _guards: vec![g1, g2, g3],
    }
}

#[tokio::test]
async fn login_groups_services_by_advertised_auth_endpoint() {
    let fx = fixture().await;
    let stored = fx.manager.login("did:web:a.test").await.unwrap();

    // Two groups: one token covers the bucket and the personal inbox.
    assert_eq!(stored.grants.len(), 2);
    let calls = fx.authorizer.authorized.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    let one = calls
        .iter()
        .find(|(auth, _, _)| auth == "https://auth-one.test")
        .unwrap();
    assert!(one.2.contains(&fx.bucket_url));
    assert!(one.2.contains(&fx.inbox_url));

    // Persisted under the sessions key, and the in-progress record is gone.
    assert!(fx.store.get_kv(SESSIONS_KEY).unwrap().is_some());
    assert!(fx.store.get_kv(LOGIN_IN_PROGRESS_KEY).unwrap().is_none());

    // Resolution produces the rich per-service map.
    let session = fx.manager.resolve_session(&stored).await.unwrap();
    assert_eq!(session.actor, "did:web:a.test");
    assert_eq!(session.storage_bucket.endpoint, fx.bucket_url);
    assert_eq!(session.personal_inbox.endpoint, fx.inbox_url);
    assert_eq!(session.storage_bucket.token, session.personal_inbox.token);
    assert_eq!(session.shared_inboxes, [fx.shared_url.clone()]);
}

#[tokio::test]
async fn concurrent_logins_for_one_actor_are_rejected() {
    let fx = fixture().await;
    let gate = Arc::new(tokio::sync::Notify::new());
    *fx.authorizer.gate.lock().unwrap() = Some(gate.clone());

    let manager = fx.manager.clone();
    let first = tokio::spawn(async move { manager.login("did:web:a.test").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(
        fx.manager.login("did:web:a.test").await,
        Err(GraffitiError::Forbidden(_))
    ));

    // Unpark the flow and drop the gate so the second group runs through.
    *fx.authorizer.gate.lock().unwrap() = None;
    gate.notify_waiters();
    let stored = first.await.unwrap().unwrap();
    assert_eq!(stored.grants.len(), 2);
}

#[tokio::test]
async fn logout_revokes_grants_and_clears_the_session() {
    let fx = fixture().await;
    let stored = fx.manager.login("did:web:a.test").await.unwrap();
    assert_eq!(fx.manager.sessions().unwrap().len(), 1);

    fx.manager.logout("did:web:a.test").await.unwrap();
    assert!(fx.manager.sessions().unwrap().is_empty());

    let revoked = fx.authorizer.revoked.lock().unwrap().clone();
    assert_eq!(revoked.len(), stored.grants.len());

    // A second logout has nothing to act on.
    assert!(matches!(
        fx.manager.logout("did:web:a.test").await,
        Err(GraffitiError::NotFound(_))
    ));
}

#[tokio::test]
async fn relogin_replaces_the_stored_session() {
    let fx = fixture().await;
    fx.manager.login("did:web:a.test").await.unwrap();
    fx.manager.login("did:web:a.test").await.unwrap();
    assert_eq!(fx.manager.sessions().unwrap().len(), 1);
}

#[tokio::test]
async fn stale_in_progress_records_are_swept() {
    let fx = fixture().await;
    fx.store
        .put_kv(
            LOGIN_IN_PROGRESS_KEY,
            r#"{"actor":"did:web:a.test","started_at":0,"groups_total":2,"groups_done":1}"#,
        )
        .unwrap();
    fx.manager.sweep_stale_flows().unwrap();
    assert!(fx.store.get_kv(LOGIN_IN_PROGRESS_KEY).unwrap().is_none());
}

#[tokio::test]
async fn resolve_session_demands_a_covering_token() {
    let fx = fixture().await;
    let mut stored = fx.manager.login("did:web:a.test").await.unwrap();
    stored.grants.retain(|g| g.auth_endpoint != "https://auth-one.test");
    assert!(matches!(
        fx.manager.resolve_session(&stored).await,
        Err(GraffitiError::Unauthorized(_))
    ));
}
