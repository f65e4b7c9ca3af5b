//! Session renewal coordinator: sole owner and writer of the credential pair.

use std::sync::{Arc, Mutex, MutexGuard};

use backend_core::{
    BackendError, BackendErrorCategory, CredentialPair, UserProfile, normalize_failure_response,
    unwrap_success_envelope,
};
use backend_platform::CredentialStore;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    http::{HttpExecutor, HttpRequest},
    transport::REFRESH_PATH,
};

type RenewalOutcome = Result<CredentialPair, BackendError>;
type PendingRenewal = Shared<BoxFuture<'static, RenewalOutcome>>;

/// Identifies one signed-in session.
///
/// Every establish, restore, sign-out and expiry moves to a new epoch. Work
/// started under an older epoch may not install or clear credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SessionEpoch(pub(crate) u64);

#[derive(Default)]
struct SessionSlot {
    epoch: SessionEpoch,
    credentials: Option<CredentialPair>,
    profile: Option<UserProfile>,
    needs_renewal: bool,
    pending: Option<PendingRenewal>,
}

impl SessionSlot {
    fn advance(&mut self) {
        self.epoch = SessionEpoch(self.epoch.0.wrapping_add(1));
        self.needs_renewal = false;
        self.pending = None;
    }

    fn forget(&mut self) -> Option<CredentialPair> {
        self.advance();
        self.profile = None;
        self.credentials.take()
    }
}

struct Inner {
    store: CredentialStore,
    executor: Arc<dyn HttpExecutor>,
    slot: Mutex<SessionSlot>,
    expired_tx: watch::Sender<bool>,
}

/// Hands out valid access credentials and runs at most one renewal at a time.
///
/// A renewal runs on its own task; callers await a shared handle to it, so a
/// caller that gives up never cancels the renewal for everyone else.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(store: CredentialStore, executor: Arc<dyn HttpExecutor>) -> Self {
        let (expired_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                slot: Mutex::new(SessionSlot::default()),
                expired_tx,
            }),
        }
    }

    /// Watch the process-wide expiry flag. It flips to `true` exactly once per
    /// session and resets when a new session is established.
    pub fn subscribe_expired(&self) -> watch::Receiver<bool> {
        self.inner.expired_tx.subscribe()
    }

    pub fn is_expired(&self) -> bool {
        *self.inner.expired_tx.borrow()
    }

    pub fn has_session(&self) -> bool {
        self.inner
            .lock()
            .map(|slot| slot.credentials.is_some())
            .unwrap_or(false)
    }

    /// Current epoch, to hand to [`establish`](Self::establish) or
    /// [`restore`](Self::restore) when a sign-in starts.
    pub fn epoch(&self) -> SessionEpoch {
        self.inner
            .lock()
            .map(|slot| slot.epoch)
            .unwrap_or_default()
    }

    pub fn current_profile(&self) -> Option<UserProfile> {
        self.inner.lock().ok().and_then(|slot| slot.profile.clone())
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.current_profile().map(|profile| profile.id)
    }

    /// Current access credential. No network I/O unless a renewal is required,
    /// in which case the caller joins the in-flight renewal.
    pub async fn valid_credential(&self) -> Result<String, BackendError> {
        {
            let slot = self.inner.lock()?;
            match &slot.credentials {
                None => return Err(BackendError::auth("no active session")),
                Some(pair) if !slot.needs_renewal => return Ok(pair.access_token.clone()),
                Some(_) => {}
            }
        }
        self.renew(None).await.map(|pair| pair.access_token)
    }

    /// Renew after `stale_access` was rejected, or unconditionally with `None`.
    ///
    /// When the current credential already differs from `stale_access`, another
    /// caller renewed in the meantime and the fresh pair is returned directly.
    pub async fn renew(&self, stale_access: Option<&str>) -> Result<CredentialPair, BackendError> {
        let pending = {
            let mut slot = self.inner.lock()?;

            if let Some(stale) = stale_access
                && !slot.needs_renewal
                && let Some(current) = &slot.credentials
                && current.access_token != stale
            {
                debug!("credential already renewed by a concurrent caller");
                return Ok(current.clone());
            }

            if let Some(pending) = slot.pending.clone() {
                pending
            } else {
                let epoch = slot.epoch;
                let Some(renewal_token) = slot
                    .credentials
                    .as_ref()
                    .map(|pair| pair.renewal_token.clone())
                else {
                    drop(slot);
                    return Err(self.inner.expire(epoch, "no renewal credential present"));
                };

                slot.needs_renewal = true;
                let inner = Arc::clone(&self.inner);
                let task =
                    tokio::spawn(async move { inner.run_renewal(epoch, renewal_token).await });
                let pending = async move {
                    task.await.unwrap_or_else(|err| {
                        Err(BackendError::new(
                            BackendErrorCategory::Internal,
                            "renewal_task_failed",
                            err.to_string(),
                        ))
                    })
                }
                .boxed()
                .shared();
                slot.pending = Some(pending.clone());
                pending
            }
        };

        pending.await
    }

    /// Install a pair obtained from login or registration that started at
    /// `since`. Refused when the session changed in the meantime.
    pub fn establish(
        &self,
        since: SessionEpoch,
        pair: CredentialPair,
        profile: Option<UserProfile>,
    ) -> Result<(), BackendError> {
        {
            let mut slot = self.inner.lock()?;
            if slot.epoch != since {
                debug!("sign-in completed after the session changed; discarded");
                return Err(BackendError::auth("session ended during sign-in"));
            }
            self.inner
                .store
                .save_credentials(&pair)
                .map_err(|err| err.into_backend_error("save_credentials"))?;
            if let Some(profile) = &profile
                && let Err(err) = self.inner.store.save_profile(profile)
            {
                warn!(error = %err, "failed caching user profile");
            }
            slot.advance();
            slot.credentials = Some(pair);
            slot.profile = profile;
        }
        self.inner.expired_tx.send_replace(false);
        info!("session established");
        Ok(())
    }

    /// Load a persisted session. Returns whether a credential pair was found.
    pub fn restore(&self, since: SessionEpoch) -> Result<bool, BackendError> {
        {
            let mut slot = self.inner.lock()?;
            if slot.epoch != since {
                debug!("restore requested after the session changed; discarded");
                return Err(BackendError::auth("session ended during restore"));
            }
            let pair = self
                .inner
                .store
                .load_credentials()
                .map_err(|err| err.into_backend_error("load_credentials"))?;
            let Some(pair) = pair else {
                debug!("no persisted session");
                return Ok(false);
            };
            let profile = match self.inner.store.load_profile() {
                Ok(profile) => profile,
                Err(err) => {
                    warn!(error = %err, "ignoring unreadable cached profile");
                    None
                }
            };
            slot.advance();
            slot.credentials = Some(pair);
            slot.profile = profile;
        }
        self.inner.expired_tx.send_replace(false);
        info!("session restored from credential store");
        Ok(true)
    }

    /// Forget the session on explicit logout and return the pair that was in
    /// use. Does not raise the expiry signal.
    pub fn sign_out(&self) -> Result<Option<CredentialPair>, BackendError> {
        let mut slot = self.inner.lock()?;
        let pair = slot.forget();
        self.inner
            .store
            .clear()
            .map_err(|err| err.into_backend_error("clear"))?;
        Ok(pair)
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, SessionSlot>, BackendError> {
        self.slot.lock().map_err(|_| {
            BackendError::new(
                BackendErrorCategory::Internal,
                "session_lock_poisoned",
                "session state lock poisoned",
            )
        })
    }

    async fn run_renewal(self: Arc<Self>, epoch: SessionEpoch, renewal_token: String) -> RenewalOutcome {
        let request_id = Uuid::new_v4().to_string();
        info!(%request_id, "renewing access credential");

        let request = HttpRequest {
            method: Method::POST,
            path: REFRESH_PATH.to_owned(),
            query: Vec::new(),
            body: Some(json!({ "refreshToken": renewal_token })),
            bearer: None,
            request_id: request_id.clone(),
        };

        let outcome = match self.executor.execute(request).await {
            Err(failure) => {
                warn!(%request_id, error = %failure, "renewal did not reach the server; session kept");
                Err(BackendError::network(failure.to_string()))
            }
            Ok(response) if response.is_success() => match parse_renewed_pair(&response.body) {
                Some(pair) => self.commit(epoch, pair).inspect(|_| {
                    info!(%request_id, "access credential renewed");
                }),
                None => Err(self.expire(epoch, "renewal response carried no credential pair")),
            },
            Ok(response) if matches!(response.status, 400 | 401 | 403) => {
                Err(self.expire(epoch, "renewal credential rejected"))
            }
            Ok(response) => {
                let error = normalize_failure_response(response.status, &response.body);
                warn!(%request_id, status = response.status, "renewal failed on the server; session kept");
                Err(error)
            }
        };

        if let Ok(mut slot) = self.lock()
            && slot.epoch == epoch
        {
            slot.pending = None;
        }
        outcome
    }

    /// Persist and install a renewed pair, unless the session it belongs to
    /// has ended.
    fn commit(&self, epoch: SessionEpoch, pair: CredentialPair) -> RenewalOutcome {
        let mut slot = self.lock()?;
        if slot.epoch != epoch {
            debug!("renewed pair belongs to an ended session; discarded");
            return Err(BackendError::auth("session ended during renewal"));
        }
        if let Err(err) = self.store.save_credentials(&pair) {
            warn!(error = %err, "renewed credential pair kept in memory only");
        }
        slot.credentials = Some(pair.clone());
        slot.needs_renewal = false;
        Ok(pair)
    }

    /// End the session of `epoch` for good, raising the expiry signal once.
    fn expire(&self, epoch: SessionEpoch, reason: &str) -> BackendError {
        match self.lock() {
            Ok(mut slot) if slot.epoch == epoch => {
                slot.forget();
                if let Err(err) = self.store.clear() {
                    warn!(error = %err, "failed clearing credential store on expiry");
                }
            }
            Ok(_) => {
                debug!(%reason, "renewal failure for an ended session ignored");
                return BackendError::auth("session ended during renewal");
            }
            Err(err) => return err,
        }

        let first = self.expired_tx.send_if_modified(|expired| {
            if *expired {
                false
            } else {
                *expired = true;
                true
            }
        });
        if first {
            warn!(%reason, "session expired");
        }
        BackendError::auth(format!("session expired: {reason}"))
    }
}

fn parse_renewed_pair(body: &str) -> Option<CredentialPair> {
    let value = serde_json::from_str::<Value>(body).ok()?;
    let pair: CredentialPair = serde_json::from_value(unwrap_success_envelope(value)).ok()?;
    (!pair.access_token.is_empty() && !pair.renewal_token.is_empty()).then_some(pair)
}
