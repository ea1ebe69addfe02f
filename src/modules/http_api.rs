//! HTTP endpoints for the handshake and command execution.
//!
//! Every route is registered explicitly in [`router`]; there is no name-based
//! dispatch. Gated handlers call the [`AuthorizationGate`] before touching
//! their request body.

use crate::error::{AuthorizationError, CommandError, CryptoError, HandshakeError};
use crate::modules::command::{CommandAuthority, CommandOutcome};
use crate::modules::crypto;
use crate::modules::gate::AuthorizationGate;
use crate::modules::handshake::Handshake;
use crate::modules::secure_keys::KeyStore;
use crate::modules::session_store::SessionStore;
use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Header carrying the session identifier after key exchange.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state for all endpoints
pub struct AppState {
    pub handshake: Handshake,
    pub gate: AuthorizationGate,
    pub commands: CommandAuthority,
}

impl AppState {
    /// Wire the handshake and gate to one shared session store.
    pub fn new(
        keys: Arc<KeyStore>,
        sessions: Arc<SessionStore>,
        commands: CommandAuthority,
    ) -> Self {
        Self {
            handshake: Handshake::new(keys, sessions.clone()),
            gate: AuthorizationGate::new(sessions),
            commands,
        }
    }
}

// ==================== Request/Response Types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeRequest {
    pub ts_app_public_key: String, // PEM format
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeResponse {
    pub go_core_public_key: String, // PEM format
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub encrypted_response: String, // Base64
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResponse {
    pub encrypted_response: String, // Base64, probe re-encrypted for the client
    pub own_challenge: String,      // Base64, challenge encrypted for the client
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizationRequest {
    pub secret: String, // Base64
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizationResponse {
    pub msg: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String, // Plain command line, or base64 ciphertext
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecResponse {
    pub output: String,
    pub error: String,
}

impl From<CommandOutcome> for ExecResponse {
    fn from(outcome: CommandOutcome) -> Self {
        let error = match outcome.exit_error {
            Some(exit) if outcome.stderr.trim().is_empty() => exit,
            Some(exit) => format!("{}: {}", exit, outcome.stderr.trim_end()),
            None => outcome.stderr,
        };
        ExecResponse {
            output: outcome.stdout,
            error,
        }
    }
}

/// Error body `{ "message": ..., "code": ... }`; `code` mirrors the status.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: status.as_u16(),
        }
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<JsonRejection> for ErrorResponse {
    fn from(rejection: JsonRejection) -> Self {
        warn!("Rejected request body: {}", rejection.body_text());
        Self::new(StatusCode::BAD_REQUEST, "Invalid request")
    }
}

impl From<AuthorizationError> for ErrorResponse {
    fn from(_: AuthorizationError) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Connection is not validated")
    }
}

impl From<HandshakeError> for ErrorResponse {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::BadPublicKey(reason) => {
                warn!("Rejected client public key: {}", reason);
                Self::new(
                    StatusCode::BAD_REQUEST,
                    "Failed to parse client public key",
                )
            }
            HandshakeError::SessionNotFound | HandshakeError::SessionExpired => {
                Self::new(StatusCode::UNAUTHORIZED, "Connection is not validated")
            }
            HandshakeError::DecryptionFailed => {
                Self::new(StatusCode::UNAUTHORIZED, "Failed to verify message")
            }
            HandshakeError::ChallengeMismatch => {
                Self::new(StatusCode::UNAUTHORIZED, "Failed to verify final secret")
            }
            HandshakeError::EncryptionFailed(reason) => {
                error!("Encryption toward client failed: {}", reason);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encrypt response for client",
                )
            }
            HandshakeError::Internal(reason) => {
                error!("Handshake internal error: {}", reason);
                Self::internal()
            }
        }
    }
}

impl From<CommandError> for ErrorResponse {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::DecryptionFailed => {
                Self::new(StatusCode::UNAUTHORIZED, "Failed to decrypt command")
            }
            CommandError::CommandNotAllowed(_) => Self::new(StatusCode::FORBIDDEN, e.to_string()),
            CommandError::SpawnFailed(reason) => {
                error!("Command execution failed: {}", reason);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Command execution failed")
            }
            CommandError::TimedOut(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

fn decode_field(value: &str) -> Result<Vec<u8>, ErrorResponse> {
    crypto::base64_decode(value).map_err(|e: CryptoError| {
        warn!("Rejected base64 field: {}", e);
        ErrorResponse::new(StatusCode::BAD_REQUEST, "Failed to decode message")
    })
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
}

/// Run CPU-bound handshake crypto off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ErrorResponse>
where
    F: FnOnce() -> Result<T, HandshakeError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ErrorResponse::from),
        Err(e) => {
            error!("Handshake task failed: {}", e);
            Err(ErrorResponse::internal())
        }
    }
}

// ==================== Handlers ====================

/// GET /
pub async fn root_handler() -> &'static str {
    "ServerProfileInstaller (SPI) API is running.\n"
}

/// POST /key-exchange
pub async fn key_exchange_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<KeyExchangeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ErrorResponse> {
    info!("Received request for key exchange");
    let Json(request) = payload?;

    let outcome = blocking(move || state.handshake.exchange(&request.ts_app_public_key)).await?;

    Ok((
        [(REQUEST_ID_HEADER, outcome.session_id)],
        Json(KeyExchangeResponse {
            go_core_public_key: outcome.server_public_key_pem,
        }),
    ))
}

/// POST /verify-message
pub async fn verify_message_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<VerificationRequest>, JsonRejection>,
) -> Result<Json<VerificationResponse>, ErrorResponse> {
    let session = state.gate.require_live(session_id(&headers))?;
    let Json(request) = payload?;
    let probe = decode_field(&request.encrypted_response)?;

    let outcome = blocking(move || state.handshake.verify(&session.session_id, &probe)).await?;

    Ok(Json(VerificationResponse {
        encrypted_response: crypto::base64_encode(&outcome.re_encrypted_probe),
        own_challenge: crypto::base64_encode(&outcome.encrypted_challenge),
    }))
}

/// POST /handshake-success
pub async fn handshake_success_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<FinalizationRequest>, JsonRejection>,
) -> Result<Json<FinalizationResponse>, ErrorResponse> {
    let session = state.gate.require_live(session_id(&headers))?;
    let Json(request) = payload?;
    let secret = decode_field(&request.secret)?;

    blocking(move || state.handshake.finalize(&session.session_id, &secret)).await?;

    Ok(Json(FinalizationResponse {
        msg: "handshake successful!".to_string(),
    }))
}

/// POST /exec
pub async fn exec_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ExecRequest>, JsonRejection>,
) -> Result<Json<ExecResponse>, ErrorResponse> {
    let session = state.gate.authorize(session_id(&headers))?;
    let Json(request) = payload?;

    let outcome = state.commands.execute(&session, &request.command).await?;
    Ok(Json(ExecResponse::from(outcome)))
}

/// Log the status of every response.
async fn log_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        warn!("{} {} -> {}", method, path, status);
    } else {
        info!("{} {} -> {}", method, path, status);
    }
    response
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/key-exchange", post(key_exchange_handler))
        .route("/verify-message", post(verify_message_handler))
        .route("/handshake-success", post(handshake_success_handler))
        .route("/exec", post(exec_handler))
        .layer(middleware::from_fn(log_response))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_status_mapping() {
        let cases: Vec<(ErrorResponse, u16)> = vec![
            (
                HandshakeError::BadPublicKey("x".to_string()).into(),
                400,
            ),
            (HandshakeError::SessionExpired.into(), 401),
            (HandshakeError::DecryptionFailed.into(), 401),
            (HandshakeError::ChallengeMismatch.into(), 401),
            (HandshakeError::EncryptionFailed("x".to_string()).into(), 500),
            (
                AuthorizationError::Unauthorized("not validated").into(),
                401,
            ),
            (CommandError::CommandNotAllowed("rm".to_string()).into(), 403),
            (CommandError::SpawnFailed("x".to_string()).into(), 500),
            (CommandError::TimedOut(30).into(), 500),
        ];
        for (response, code) in cases {
            assert_eq!(response.code, code, "{}", response.message);
        }
    }

    #[test]
    fn test_unauthorized_reason_is_not_exposed() {
        let a: ErrorResponse = AuthorizationError::Unauthorized("session expired").into();
        let b: ErrorResponse = AuthorizationError::Unauthorized("unknown session").into();
        assert_eq!(a.message, b.message);
    }

    #[test]
    fn test_exec_response_from_outcome() {
        let ok = ExecResponse::from(CommandOutcome {
            stdout: "file.txt\n".to_string(),
            stderr: String::new(),
            exit_error: None,
        });
        assert_eq!(ok.output, "file.txt\n");
        assert_eq!(ok.error, "");

        let failed = ExecResponse::from(CommandOutcome {
            stdout: String::new(),
            stderr: "no such file\n".to_string(),
            exit_error: Some("exit status: 2".to_string()),
        });
        assert_eq!(failed.error, "exit status: 2: no such file");
    }
}
