//! Transport client: credential attachment, one-shot renewal retry and result
//! normalization.

use std::sync::Arc;

use backend_core::{
    ApiResponse, BackendError, normalize_failure_response, unwrap_success_envelope,
};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    http::{HttpExecutor, HttpRequest, HttpResponse, TransportFailure},
    session::SessionCoordinator,
};

pub const LOGIN_PATH: &str = "auth/login";
pub const REGISTER_PATH: &str = "auth/register";
pub const REFRESH_PATH: &str = "auth/refresh";
pub const LOGOUT_PATH: &str = "auth/logout";

/// Endpoints that establish credentials and therefore never trigger renewal.
const AUTH_PATHS: [&str; 3] = [LOGIN_PATH, REGISTER_PATH, REFRESH_PATH];

/// How a request is authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// No credential attached.
    Anonymous,
    /// Current session credential; an unauthorized response triggers one
    /// renewal and retry.
    Bearer,
    /// This exact credential, whatever the session holds. An unauthorized
    /// response is returned as-is.
    Fixed(String),
}

/// Description of one API call, before credentials are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub authorization: Authorization,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            authorization: Authorization::Bearer,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn is_auth_endpoint(&self) -> bool {
        AUTH_PATHS.contains(&self.path.trim_start_matches('/'))
    }

    fn renews_on_unauthorized(&self) -> bool {
        self.authorization == Authorization::Bearer && !self.is_auth_endpoint()
    }
}

/// Issues API calls through the session coordinator.
///
/// Ordinary failures never escape as panics or transport errors; every call
/// resolves to a normalized result whose `error.code` tells failures apart.
#[derive(Clone)]
pub struct RestTransport {
    executor: Arc<dyn HttpExecutor>,
    session: SessionCoordinator,
}

impl RestTransport {
    pub fn new(executor: Arc<dyn HttpExecutor>, session: SessionCoordinator) -> Self {
        Self { executor, session }
    }

    pub fn session(&self) -> &SessionCoordinator {
        &self.session
    }

    /// Issue a request and return the normalized result shape.
    pub async fn request<T: DeserializeOwned>(&self, request: ApiRequest) -> ApiResponse<T> {
        ApiResponse::from_result(self.send(request).await)
    }

    /// Issue a request, renewing and retrying at most once on unauthorized.
    pub async fn send<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, BackendError> {
        let request_id = Uuid::new_v4().to_string();

        let bearer = match &request.authorization {
            _ if request.is_auth_endpoint() => None,
            Authorization::Anonymous => None,
            Authorization::Bearer => Some(self.session.valid_credential().await?),
            Authorization::Fixed(token) => Some(token.clone()),
        };

        let response = self.execute(&request, bearer.clone(), &request_id).await?;
        if response.status != 401 || !request.renews_on_unauthorized() {
            return finish(response);
        }

        info!(%request_id, path = %request.path, "unauthorized; renewing credential before one retry");
        let renewed = match self.session.renew(bearer.as_deref()).await {
            Ok(pair) => pair,
            Err(err) if err.is_auth() => return Err(unauthorized(&response)),
            Err(err) => return Err(err),
        };

        let retry = self
            .execute(&request, Some(renewed.access_token), &request_id)
            .await?;
        if retry.status == 401 {
            warn!(%request_id, path = %request.path, "still unauthorized after renewal");
            return Err(unauthorized(&retry));
        }
        finish(retry)
    }

    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<String>,
        request_id: &str,
    ) -> Result<HttpResponse, BackendError> {
        debug!(%request_id, method = %request.method, path = %request.path, "issuing request");
        let outbound = HttpRequest {
            method: request.method.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
            bearer,
            request_id: request_id.to_owned(),
        };

        match self.executor.execute(outbound).await {
            Ok(response) => {
                debug!(%request_id, status = response.status, "response received");
                Ok(response)
            }
            Err(TransportFailure::Build(reason)) => {
                warn!(%request_id, %reason, "request could not be built");
                Err(BackendError::unknown(reason))
            }
            Err(failure) => {
                warn!(%request_id, error = %failure, "request did not reach the server");
                Err(BackendError::network(failure.to_string()))
            }
        }
    }
}

fn finish<T: DeserializeOwned>(response: HttpResponse) -> Result<T, BackendError> {
    if !response.is_success() {
        return Err(normalize_failure_response(response.status, &response.body));
    }

    let value = if response.body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str::<Value>(&response.body)
            .map_err(|err| BackendError::unknown(format!("malformed response body: {err}")))?
    };
    serde_json::from_value(unwrap_success_envelope(value))
        .map_err(|err| BackendError::unknown(format!("unexpected response shape: {err}")))
}

fn unauthorized(response: &HttpResponse) -> BackendError {
    let server = normalize_failure_response(response.status, &response.body);
    let error = BackendError::auth(server.message);
    match server.details {
        Some(details) => error.with_details(details),
        None => error,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use backend_core::{AUTH_ERROR, CredentialPair, NETWORK_ERROR, UNKNOWN_ERROR};
    use backend_platform::CredentialStore;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::{
        session::SessionEpoch,
        testing::{FakeServer, json as respond, unauthorized as expired_token},
    };

    #[derive(Debug, Deserialize, PartialEq)]
    struct Echo {
        value: u32,
    }

    fn transport(server: &Arc<FakeServer>) -> RestTransport {
        let session = SessionCoordinator::new(CredentialStore::in_memory(), server.clone());
        session
            .establish(SessionEpoch::default(), CredentialPair::new("a1", "r1"), None)
            .expect("establish");
        RestTransport::new(server.clone(), session)
    }

    fn renewal_succeeds(server: &FakeServer) {
        server.route("POST", REFRESH_PATH, |_| {
            respond(200, json!({"accessToken": "a2", "refreshToken": "r2"}))
        });
    }

    #[tokio::test]
    async fn attaches_bearer_and_unwraps_envelope() {
        let server = FakeServer::new();
        server.route("GET", "echo", |req| {
            assert_eq!(req.bearer.as_deref(), Some("a1"));
            respond(200, json!({"success": true, "data": {"value": 7}}))
        });
        let transport = transport(&server);

        let response: ApiResponse<Echo> = transport.request(ApiRequest::get("echo")).await;
        assert_eq!(response, ApiResponse::ok(Echo { value: 7 }));
    }

    #[tokio::test]
    async fn unauthorized_request_is_renewed_and_retried_once() {
        let server = FakeServer::new();
        renewal_succeeds(&server);
        server.route("GET", "echo", |req| match req.bearer.as_deref() {
            Some("a2") => respond(200, json!({"value": 1})),
            _ => expired_token(),
        });
        let transport = transport(&server);

        let echo: Echo = transport
            .send(ApiRequest::get("echo"))
            .await
            .expect("retry should succeed");

        assert_eq!(echo, Echo { value: 1 });
        assert_eq!(server.calls_to("GET", "echo"), 2);
        assert_eq!(server.calls_to("POST", REFRESH_PATH), 1);

        let ids: Vec<String> = server
            .requests()
            .into_iter()
            .filter(|req| req.path == "echo")
            .map(|req| req.request_id)
            .collect();
        assert_eq!(ids[0], ids[1], "retry keeps the request id");
    }

    #[tokio::test]
    async fn unauthorized_retry_is_not_retried_again() {
        let server = FakeServer::new();
        renewal_succeeds(&server);
        server.route("GET", "echo", |_| expired_token());
        let transport = transport(&server);

        let response: ApiResponse<Echo> = transport.request(ApiRequest::get("echo")).await;

        assert!(!response.success);
        assert_eq!(response.error_code(), Some(AUTH_ERROR));
        assert_eq!(server.calls_to("GET", "echo"), 2);
        assert_eq!(server.calls_to("POST", REFRESH_PATH), 1);
    }

    #[tokio::test]
    async fn concurrent_unauthorized_requests_share_one_renewal() {
        let server = FakeServer::new();
        server.route_with_delay("POST", REFRESH_PATH, Duration::from_millis(30), |_| {
            respond(200, json!({"accessToken": "a2", "refreshToken": "r2"}))
        });
        server.route("GET", "echo", |req| match req.bearer.as_deref() {
            Some("a2") => respond(200, json!({"value": 3})),
            _ => expired_token(),
        });
        let transport = transport(&server);

        let calls = (0..5).map(|_| {
            let transport = transport.clone();
            tokio::spawn(async move { transport.send::<Echo>(ApiRequest::get("echo")).await })
        });
        for result in futures::future::join_all(calls).await {
            assert_eq!(result.expect("task").expect("request"), Echo { value: 3 });
        }
        assert_eq!(server.calls_to("POST", REFRESH_PATH), 1);
    }

    #[tokio::test]
    async fn rejected_renewal_surfaces_auth_error_after_expiry_signal() {
        let server = FakeServer::new();
        server.route("POST", REFRESH_PATH, |_| {
            respond(401, json!({"message": "refresh token revoked"}))
        });
        server.route("GET", "echo", |_| expired_token());
        let transport = transport(&server);

        let err = transport
            .send::<Echo>(ApiRequest::get("echo"))
            .await
            .expect_err("request must fail");

        assert_eq!(err.code, AUTH_ERROR);
        assert_eq!(err.message, "Token expired");
        assert!(transport.session().is_expired());
        assert_eq!(server.calls_to("GET", "echo"), 1);
    }

    #[tokio::test]
    async fn failing_login_never_triggers_renewal() {
        let server = FakeServer::new();
        server.route("POST", LOGIN_PATH, |req| {
            assert_eq!(req.bearer, None);
            respond(401, json!({"message": "Invalid email or password"}))
        });
        let transport = transport(&server);

        let response: ApiResponse<Value> = transport
            .request(
                ApiRequest::post(LOGIN_PATH)
                    .with_authorization(Authorization::Anonymous)
                    .with_body(json!({"email": "a@example.org", "password": "nope"})),
            )
            .await;

        assert_eq!(response.error_code(), Some("401"));
        assert_eq!(response.message.as_deref(), Some("Invalid email or password"));
        assert_eq!(server.calls_to("POST", REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn auth_paths_never_renew_even_with_bearer_authorization() {
        let server = FakeServer::new();
        server.route("POST", REGISTER_PATH, |_| expired_token());
        let transport = transport(&server);

        let request = ApiRequest::post(REGISTER_PATH);
        assert!(request.is_auth_endpoint());
        let err = transport
            .send::<Value>(request)
            .await
            .expect_err("register fails");

        assert_eq!(err.code, "401");
        assert_eq!(server.calls_to("POST", REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn unreachable_server_is_network_error() {
        let server = FakeServer::new();
        server.route("GET", "echo", |_| {
            Err(TransportFailure::Unreachable("connection refused".to_owned()))
        });
        let transport = transport(&server);

        let response: ApiResponse<Echo> = transport.request(ApiRequest::get("echo")).await;
        assert_eq!(response.error_code(), Some(NETWORK_ERROR));
    }

    #[tokio::test]
    async fn build_failure_is_unknown_error() {
        let server = FakeServer::new();
        server.route("GET", "echo", |_| {
            Err(TransportFailure::Build("bad header".to_owned()))
        });
        let transport = transport(&server);

        let response: ApiResponse<Echo> = transport.request(ApiRequest::get("echo")).await;
        assert_eq!(response.error_code(), Some(UNKNOWN_ERROR));
    }

    #[tokio::test]
    async fn validation_failure_uses_first_structured_message() {
        let server = FakeServer::new();
        server.route("POST", "conversations", |_| {
            respond(
                422,
                json!({
                    "message": "Validation failed",
                    "errors": [{"msg": "Name is required", "param": "name"}]
                }),
            )
        });
        let transport = transport(&server);

        let response: ApiResponse<Value> = transport
            .request(ApiRequest::post("conversations").with_body(json!({})))
            .await;

        let error = response.error.expect("failure carries an error");
        assert_eq!(error.code, "422");
        assert_eq!(error.message, "Name is required");
        assert!(error.details.is_some());
    }

    #[tokio::test]
    async fn server_error_without_body_gets_generic_message() {
        let server = FakeServer::new();
        server.route("GET", "echo", |_| Ok(HttpResponse::new(503, "")));
        let transport = transport(&server);

        let err = transport
            .send::<Echo>(ApiRequest::get("echo"))
            .await
            .expect_err("503 fails");
        assert_eq!(err.code, "503");
        assert_eq!(err.message, "Server error (503)");
        assert!(err.category.is_retryable());
    }

    #[tokio::test]
    async fn malformed_success_body_is_unknown_error() {
        let server = FakeServer::new();
        server.route("GET", "echo", |_| Ok(HttpResponse::new(200, "<html>oops</html>")));
        let transport = transport(&server);

        let response: ApiResponse<Echo> = transport.request(ApiRequest::get("echo")).await;
        assert_eq!(response.error_code(), Some(UNKNOWN_ERROR));
    }

    #[tokio::test]
    async fn request_without_session_fails_with_auth_error() {
        let server = FakeServer::new();
        let session = SessionCoordinator::new(CredentialStore::in_memory(), server.clone());
        let transport = RestTransport::new(server.clone(), session);

        let response: ApiResponse<Echo> = transport.request(ApiRequest::get("echo")).await;
        assert_eq!(response.error_code(), Some(AUTH_ERROR));
        assert!(server.requests().is_empty());
    }
}
