//! REST/websocket implementation of the chat backend.
//!
//! Layers, leaves first: [`http`] executes raw calls, [`session`] owns the
//! credential pair and its single in-flight renewal, [`transport`] attaches
//! credentials and normalizes results, [`api`] types the endpoints, [`push`]
//! keeps the event channel connected and [`runtime`] serializes everything
//! into the conversation engine.

use std::sync::Arc;

use backend_core::BackendError;
use backend_platform::CredentialStore;

pub mod api;
pub mod config;
pub mod http;
pub mod push;
pub mod runtime;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::{AuthGrant, ChatApi, ConversationService, MutationReply};
pub use config::{ClientConfig, ConfigError};
pub use http::{HttpExecutor, HttpRequest, HttpResponse, ReqwestExecutor, TransportFailure};
pub use push::{EventBus, PushConnection, PushLinkState, SubscriptionId};
pub use runtime::{RuntimeHandle, RuntimeOptions, spawn_runtime};
pub use session::{SessionCoordinator, SessionEpoch};
pub use transport::{ApiRequest, Authorization, RestTransport};

/// Credential store for `config`: the OS keyring when the `os-keyring`
/// feature is enabled, process memory otherwise.
pub fn credential_store(config: &ClientConfig) -> CredentialStore {
    #[cfg(feature = "os-keyring")]
    {
        CredentialStore::new(Arc::new(backend_platform::KeyringStore::new(
            config.keyring_service.clone(),
        )))
    }
    #[cfg(not(feature = "os-keyring"))]
    {
        tracing::debug!(
            service = %config.keyring_service,
            "os-keyring feature disabled; credentials kept in memory"
        );
        CredentialStore::in_memory()
    }
}

/// Wire the reqwest executor, session coordinator and transport into an API client.
pub fn build_api(config: &ClientConfig, store: CredentialStore) -> Result<ChatApi, BackendError> {
    let executor: Arc<dyn HttpExecutor> = Arc::new(
        ReqwestExecutor::new(config.api_base_url.clone(), config.request_timeout)
            .map_err(|err| BackendError::unknown(err.to_string()))?,
    );
    let session = SessionCoordinator::new(store, Arc::clone(&executor));
    Ok(ChatApi::new(RestTransport::new(executor, session)))
}

/// Build the API client and spawn the runtime driving it.
pub fn start(config: &ClientConfig, store: CredentialStore) -> Result<RuntimeHandle, BackendError> {
    let api = build_api(config, store)?;
    Ok(spawn_runtime(
        Arc::new(api),
        RuntimeOptions::from_config(config),
    ))
}
