//! Typed REST endpoints and the service seam the runtime drives.

use async_trait::async_trait;
use backend_core::{
    ApiResponse, BackendError, BackendErrorCategory, ConversationSummary, CredentialPair,
    MutationKind, UserProfile, VALIDATION_ERROR,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    session::SessionEpoch,
    transport::{ApiRequest, Authorization, LOGIN_PATH, LOGOUT_PATH, REGISTER_PATH, RestTransport},
};

/// Login/registration response body.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthGrant {
    #[serde(flatten)]
    pub credentials: CredentialPair,
    pub user: UserProfile,
}

/// Body of archive/unarchive/delete responses.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MutationReply {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl Default for MutationReply {
    fn default() -> Self {
        Self {
            success: true,
            message: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Everything the runtime needs from the server side.
///
/// Sign-in calls carry the [`SessionEpoch`] observed when they were issued and
/// fail with an auth error if the session was ended before they complete.
#[async_trait]
pub trait ConversationService: Send + Sync {
    fn session_epoch(&self) -> SessionEpoch;

    async fn login(
        &self,
        email: &str,
        password: &str,
        since: SessionEpoch,
    ) -> Result<UserProfile, BackendError>;

    async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
        since: SessionEpoch,
    ) -> Result<UserProfile, BackendError>;

    /// Resume a persisted session; `false` when none was stored.
    async fn restore(&self, since: SessionEpoch) -> Result<bool, BackendError>;

    /// Drop the local session and credential store at once. Returns the
    /// access credential that was in use, for [`revoke`](Self::revoke).
    fn end_session(&self) -> Result<Option<String>, BackendError>;

    /// Best-effort server-side invalidation of `access_token`.
    async fn revoke(&self, access_token: String) -> Result<(), BackendError>;

    async fn logout(&self) -> Result<(), BackendError> {
        if let Some(access_token) = self.end_session()?
            && let Err(err) = self.revoke(access_token).await
        {
            warn!(code = %err.code, "server logout failed; local session already cleared");
        }
        Ok(())
    }

    async fn fetch_snapshot(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>, BackendError>;

    async fn mutate(&self, conversation_id: &str, kind: MutationKind) -> Result<(), BackendError>;

    /// Access credential for the push channel handshake.
    async fn push_credential(&self) -> Result<String, BackendError>;

    /// Renew after the push handshake rejected `stale`; returns the new credential.
    async fn renew_push_credential(&self, stale: &str) -> Result<String, BackendError>;

    fn current_user_id(&self) -> Option<String>;

    fn subscribe_expired(&self) -> watch::Receiver<bool>;
}

/// REST API of the chat server.
#[derive(Clone)]
pub struct ChatApi {
    transport: RestTransport,
}

impl ChatApi {
    pub fn new(transport: RestTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &RestTransport {
        &self.transport
    }

    pub async fn login_request(&self, email: &str, password: &str) -> ApiResponse<AuthGrant> {
        self.transport
            .request(
                ApiRequest::post(LOGIN_PATH)
                    .with_authorization(Authorization::Anonymous)
                    .with_body(json!({ "email": email, "password": password })),
            )
            .await
    }

    pub async fn register_request(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> ApiResponse<AuthGrant> {
        self.transport
            .request(
                ApiRequest::post(REGISTER_PATH)
                    .with_authorization(Authorization::Anonymous)
                    .with_body(json!({
                        "username": username,
                        "email": email,
                        "password": password,
                    })),
            )
            .await
    }

    pub async fn fetch_snapshot_page(
        &self,
        limit: u32,
        offset: u32,
    ) -> ApiResponse<Vec<ConversationSummary>> {
        self.transport
            .request(
                ApiRequest::get("conversations")
                    .with_query("limit", limit)
                    .with_query("offset", offset),
            )
            .await
    }

    pub async fn archive_conversation(&self, conversation_id: &str) -> ApiResponse<MutationReply> {
        self.mutation(conversation_id, MutationKind::Archive).await
    }

    pub async fn unarchive_conversation(
        &self,
        conversation_id: &str,
    ) -> ApiResponse<MutationReply> {
        self.mutation(conversation_id, MutationKind::Unarchive).await
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> ApiResponse<MutationReply> {
        self.mutation(conversation_id, MutationKind::Delete).await
    }

    async fn mutation(&self, conversation_id: &str, kind: MutationKind) -> ApiResponse<MutationReply> {
        let conversation = conversation_path(conversation_id);
        let request = match kind {
            MutationKind::Archive => ApiRequest::post(format!("{conversation}/archive")),
            MutationKind::Unarchive => ApiRequest::post(format!("{conversation}/unarchive")),
            MutationKind::Delete => ApiRequest::delete(conversation),
        };

        // An empty 2xx body counts as acceptance.
        match self.transport.send::<Option<MutationReply>>(request).await {
            Ok(Some(MutationReply {
                success: false,
                message,
            })) => ApiResponse::failure(BackendError::new(
                BackendErrorCategory::Validation,
                VALIDATION_ERROR,
                message.unwrap_or_else(|| format!("{} was rejected", kind.as_str())),
            )),
            Ok(reply) => ApiResponse::ok(reply.unwrap_or_default()),
            Err(err) => ApiResponse::failure(err),
        }
    }

    fn complete_sign_in(
        &self,
        since: SessionEpoch,
        grant: AuthGrant,
    ) -> Result<UserProfile, BackendError> {
        self.transport
            .session()
            .establish(since, grant.credentials, Some(grant.user.clone()))?;
        info!(user_id = %grant.user.id, "signed in");
        Ok(grant.user)
    }
}

/// `conversations/{id}` with the id escaped as a single path segment.
fn conversation_path(conversation_id: &str) -> String {
    format!("conversations/{}", urlencoding::encode(conversation_id))
}

#[async_trait]
impl ConversationService for ChatApi {
    fn session_epoch(&self) -> SessionEpoch {
        self.transport.session().epoch()
    }

    async fn login(
        &self,
        email: &str,
        password: &str,
        since: SessionEpoch,
    ) -> Result<UserProfile, BackendError> {
        let grant = self.login_request(email, password).await.into_result()?;
        self.complete_sign_in(since, grant)
    }

    async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
        since: SessionEpoch,
    ) -> Result<UserProfile, BackendError> {
        let grant = self
            .register_request(username, email, password)
            .await
            .into_result()?;
        self.complete_sign_in(since, grant)
    }

    async fn restore(&self, since: SessionEpoch) -> Result<bool, BackendError> {
        self.transport.session().restore(since)
    }

    fn end_session(&self) -> Result<Option<String>, BackendError> {
        let pair = self.transport.session().sign_out()?;
        info!("signed out");
        Ok(pair.map(|pair| pair.access_token))
    }

    async fn revoke(&self, access_token: String) -> Result<(), BackendError> {
        self.transport
            .send::<Option<Value>>(
                ApiRequest::post(LOGOUT_PATH).with_authorization(Authorization::Fixed(access_token)),
            )
            .await
            .map(|_| ())
    }

    async fn fetch_snapshot(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>, BackendError> {
        let page = self.fetch_snapshot_page(limit, offset).await.into_result()?;
        debug!(limit, offset, received = page.len(), "snapshot page fetched");
        Ok(page)
    }

    async fn mutate(&self, conversation_id: &str, kind: MutationKind) -> Result<(), BackendError> {
        self.mutation(conversation_id, kind)
            .await
            .into_result()
            .map(|_| ())
    }

    async fn push_credential(&self) -> Result<String, BackendError> {
        self.transport.session().valid_credential().await
    }

    async fn renew_push_credential(&self, stale: &str) -> Result<String, BackendError> {
        self.transport
            .session()
            .renew(Some(stale))
            .await
            .map(|pair| pair.access_token)
    }

    fn current_user_id(&self) -> Option<String> {
        self.transport.session().current_user_id()
    }

    fn subscribe_expired(&self) -> watch::Receiver<bool> {
        self.transport.session().subscribe_expired()
    }
}
