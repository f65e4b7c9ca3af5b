//! Fakes shared by the unit tests of this crate: a scripted HTTP server and
//! an in-process conversation service.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use backend_core::{
    BackendError, ConversationKind, ConversationSummary, LastMessage, MessageType, MutationKind,
    UserProfile,
};
use serde_json::Value;
use tokio::sync::watch;

use crate::{
    api::ConversationService,
    http::{HttpExecutor, HttpRequest, HttpResponse, TransportFailure},
    session::SessionEpoch,
};

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportFailure> + Send + Sync>;

struct Route {
    handler: Handler,
    delay: Duration,
}

#[derive(Default)]
pub(crate) struct FakeServer {
    routes: Mutex<HashMap<String, Arc<Route>>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl FakeServer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn route<F>(&self, method: &str, path: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportFailure> + Send + Sync + 'static,
    {
        self.route_with_delay(method, path, Duration::ZERO, handler);
    }

    pub(crate) fn route_with_delay<F>(&self, method: &str, path: &str, delay: Duration, handler: F)
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportFailure> + Send + Sync + 'static,
    {
        self.routes.lock().expect("routes lock").insert(
            route_key(method, path),
            Arc::new(Route {
                handler: Box::new(handler),
                delay,
            }),
        );
    }

    pub(crate) fn calls_to(&self, method: &str, path: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|call| call.method.as_str() == method && call.path == path)
            .count()
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl HttpExecutor for FakeServer {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(request.clone());

        let route = self
            .routes
            .lock()
            .expect("routes lock")
            .get(&route_key(request.method.as_str(), &request.path))
            .cloned();
        let Some(route) = route else {
            return Ok(HttpResponse::new(404, r#"{"message":"no such route"}"#));
        };

        if !route.delay.is_zero() {
            tokio::time::sleep(route.delay).await;
        }
        (route.handler)(&request)
    }
}

pub(crate) fn json(status: u16, body: Value) -> Result<HttpResponse, TransportFailure> {
    Ok(HttpResponse::new(status, body.to_string()))
}

pub(crate) fn unauthorized() -> Result<HttpResponse, TransportFailure> {
    json(401, serde_json::json!({"message": "Token expired"}))
}

fn route_key(method: &str, path: &str) -> String {
    format!("{method} {path}")
}

/// Conversation summary whose last message id is `{id}-m{created_at}`.
pub(crate) fn summary(id: &str, created_at: Option<i64>, unread_count: u32) -> ConversationSummary {
    ConversationSummary {
        id: id.to_owned(),
        kind: ConversationKind::Direct,
        display_name: format!("Conversation {id}"),
        last_message: created_at.map(|created_at| LastMessage {
            id: format!("{id}-m{created_at}"),
            content: format!("message at {created_at}"),
            message_type: MessageType::Text,
            sender_id: "u2".to_owned(),
            created_at,
        }),
        unread_count,
        is_favorite: false,
        is_archived: false,
    }
}

/// In-process [`ConversationService`] with scriptable outcomes.
pub(crate) struct FakeService {
    snapshot: Mutex<Vec<ConversationSummary>>,
    snapshot_delay: Mutex<Duration>,
    snapshot_calls: AtomicUsize,
    failing_mutations: Mutex<HashSet<String>>,
    mutation_calls: AtomicUsize,
    login_error: Mutex<Option<BackendError>>,
    login_delay: Mutex<Duration>,
    stored_session: AtomicBool,
    epoch: AtomicU64,
    user_id: Mutex<Option<String>>,
    access_token: Mutex<String>,
    logout_calls: AtomicUsize,
    revoked: Mutex<Vec<String>>,
    push_renewals: Mutex<Vec<String>>,
    expired_tx: watch::Sender<bool>,
}

impl FakeService {
    pub(crate) fn new() -> Arc<Self> {
        let (expired_tx, _) = watch::channel(false);
        Arc::new(Self {
            snapshot: Mutex::new(Vec::new()),
            snapshot_delay: Mutex::new(Duration::ZERO),
            snapshot_calls: AtomicUsize::new(0),
            failing_mutations: Mutex::new(HashSet::new()),
            mutation_calls: AtomicUsize::new(0),
            login_error: Mutex::new(None),
            login_delay: Mutex::new(Duration::ZERO),
            stored_session: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            user_id: Mutex::new(None),
            access_token: Mutex::new("a1".to_owned()),
            logout_calls: AtomicUsize::new(0),
            revoked: Mutex::new(Vec::new()),
            push_renewals: Mutex::new(Vec::new()),
            expired_tx,
        })
    }

    pub(crate) fn set_snapshot(&self, snapshot: Vec<ConversationSummary>) {
        *self.snapshot.lock().expect("snapshot lock") = snapshot;
    }

    pub(crate) fn set_snapshot_delay(&self, delay: Duration) {
        *self.snapshot_delay.lock().expect("delay lock") = delay;
    }

    pub(crate) fn set_login_delay(&self, delay: Duration) {
        *self.login_delay.lock().expect("delay lock") = delay;
    }

    pub(crate) fn fail_mutations_for(&self, conversation_id: &str) {
        self.failing_mutations
            .lock()
            .expect("mutations lock")
            .insert(conversation_id.to_owned());
    }

    pub(crate) fn fail_login(&self, error: BackendError) {
        *self.login_error.lock().expect("login lock") = Some(error);
    }

    pub(crate) fn with_stored_session(&self) {
        self.stored_session.store(true, Ordering::SeqCst);
    }

    pub(crate) fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn revoked(&self) -> Vec<String> {
        self.revoked.lock().expect("revoked lock").clone()
    }

    /// Stale credentials handed to [`ConversationService::renew_push_credential`].
    pub(crate) fn push_renewals(&self) -> Vec<String> {
        self.push_renewals.lock().expect("renewals lock").clone()
    }

    pub(crate) fn is_signed_in(&self) -> bool {
        self.user_id.lock().expect("user lock").is_some()
    }

    /// Raise the session expiry signal, as a rejected renewal would.
    pub(crate) fn expire(&self) {
        *self.user_id.lock().expect("user lock") = None;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.expired_tx.send_replace(true);
    }

    fn sign_in(&self, since: SessionEpoch) -> Result<UserProfile, BackendError> {
        if self
            .epoch
            .compare_exchange(since.0, since.0 + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BackendError::auth("session ended during sign-in"));
        }
        *self.user_id.lock().expect("user lock") = Some("u1".to_owned());
        self.expired_tx.send_replace(false);
        Ok(UserProfile {
            id: "u1".to_owned(),
            username: "alice".to_owned(),
            display_name: None,
            email: None,
        })
    }
}

#[async_trait]
impl ConversationService for FakeService {
    fn session_epoch(&self) -> SessionEpoch {
        SessionEpoch(self.epoch.load(Ordering::SeqCst))
    }

    async fn login(
        &self,
        _email: &str,
        _password: &str,
        since: SessionEpoch,
    ) -> Result<UserProfile, BackendError> {
        let delay = *self.login_delay.lock().expect("delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.login_error.lock().expect("login lock").clone() {
            return Err(error);
        }
        self.sign_in(since)
    }

    async fn register(
        &self,
        _username: &str,
        email: &str,
        password: &str,
        since: SessionEpoch,
    ) -> Result<UserProfile, BackendError> {
        self.login(email, password, since).await
    }

    async fn restore(&self, since: SessionEpoch) -> Result<bool, BackendError> {
        if self.stored_session.load(Ordering::SeqCst) {
            self.sign_in(since).map(|_| true)
        } else {
            Ok(false)
        }
    }

    fn end_session(&self) -> Result<Option<String>, BackendError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let was_signed_in = self.user_id.lock().expect("user lock").take().is_some();
        Ok(was_signed_in.then(|| self.access_token.lock().expect("token lock").clone()))
    }

    async fn revoke(&self, access_token: String) -> Result<(), BackendError> {
        self.revoked.lock().expect("revoked lock").push(access_token);
        Ok(())
    }

    async fn fetch_snapshot(
        &self,
        _limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>, BackendError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.snapshot_delay.lock().expect("delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if offset > 0 {
            return Ok(Vec::new());
        }
        Ok(self.snapshot.lock().expect("snapshot lock").clone())
    }

    async fn mutate(&self, conversation_id: &str, _kind: MutationKind) -> Result<(), BackendError> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_mutations
            .lock()
            .expect("mutations lock")
            .contains(conversation_id)
        {
            return Err(BackendError::network("server unreachable"));
        }
        Ok(())
    }

    async fn push_credential(&self) -> Result<String, BackendError> {
        if *self.expired_tx.borrow() {
            return Err(BackendError::auth("session expired"));
        }
        Ok(self.access_token.lock().expect("token lock").clone())
    }

    /// Hands out `a2`, `a3`, ... in turn.
    async fn renew_push_credential(&self, stale: &str) -> Result<String, BackendError> {
        if *self.expired_tx.borrow() {
            return Err(BackendError::auth("session expired"));
        }
        let mut renewals = self.push_renewals.lock().expect("renewals lock");
        renewals.push(stale.to_owned());
        let fresh = format!("a{}", renewals.len() + 1);
        *self.access_token.lock().expect("token lock") = fresh.clone();
        Ok(fresh)
    }

    fn current_user_id(&self) -> Option<String> {
        self.user_id.lock().expect("user lock").clone()
    }

    fn subscribe_expired(&self) -> watch::Receiver<bool> {
        self.expired_tx.subscribe()
    }
}
