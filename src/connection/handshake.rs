//! Startup exchange.
//!
//! 1. OPTIONS, when asked to or when compression must be negotiated
//! 2. STARTUP with the CQL version and the chosen compression
//! 3. READY, or AUTHENTICATE followed by AUTH_RESPONSE rounds until
//!    AUTH_SUCCESS
//!
//! Every step runs as an ordinary request on the multiplexer, so a dead
//! socket surfaces here as the connection's failure reason.

use crate::compression::{self, SharedCompressor};
use crate::error::{Result, WireError};
use crate::protocol::ProtocolVersion;
use crate::request::{startup_keys, Request};
use crate::response::{codes, ResponseBody, ServerError};

use super::{AuthProvider, ConnectionState, Shared};

pub(super) async fn perform(
    shared: &Shared,
    requested: &SharedCompressor,
    auth: Option<&dyn AuthProvider>,
) -> Result<()> {
    let mut negotiated = None;
    if shared.config.send_options_on_startup || requested.name().is_some() {
        let supported = match exchange(shared, "OPTIONS", &Request::Options).await? {
            ResponseBody::Supported(supported) => supported,
            other => return Err(unexpected("OPTIONS", &other)),
        };
        tracing::debug!(
            compression = ?supported.compression(),
            cql_versions = ?supported.cql_versions(),
            "server options"
        );
        negotiated = compression::negotiate(requested, supported.compression());
    }

    let mut options = vec![(
        startup_keys::CQL_VERSION.to_string(),
        shared.config.cql_version.clone(),
    )];
    if let Some(compressor) = negotiated {
        if let Some(name) = compressor.name() {
            options.push((startup_keys::COMPRESSION.to_string(), name.to_string()));
        }
        // The server may compress its answer to STARTUP already.
        let _ = shared.compressor.set(compressor);
    }

    match exchange(shared, "STARTUP", &Request::Startup { options }).await? {
        ResponseBody::Ready => Ok(()),
        ResponseBody::Authenticate { authenticator } => {
            authenticate(shared, &authenticator, auth).await
        }
        other => Err(unexpected("STARTUP", &other)),
    }
}

async fn authenticate(
    shared: &Shared,
    authenticator: &str,
    provider: Option<&dyn AuthProvider>,
) -> Result<()> {
    let provider = provider.ok_or_else(|| {
        WireError::Authentication(format!(
            "server requires authentication with {} but no credentials are configured",
            authenticator
        ))
    })?;
    if shared.version == ProtocolVersion::V1 {
        return Err(WireError::Authentication(
            "v1 credentials exchange is not supported".into(),
        ));
    }

    shared
        .state
        .transition(ConnectionState::AuthenticatingChallenge);
    let mut session = provider.new_authenticator(authenticator)?;
    let mut token = session.initial_response()?;

    loop {
        let request = Request::AuthResponse { token };
        match exchange(shared, "AUTH_RESPONSE", &request).await? {
            ResponseBody::AuthChallenge { token: challenge } => {
                tracing::trace!(authenticator, "auth challenge");
                token = session.evaluate_challenge(challenge.as_deref())?;
            }
            ResponseBody::AuthSuccess { token: last } => {
                session.on_success(last.as_deref())?;
                tracing::debug!(authenticator, peer = %shared.peer, "authenticated");
                return Ok(());
            }
            other => return Err(unexpected("AUTH_RESPONSE", &other)),
        }
    }
}

/// Run one startup step; server errors are mapped, not returned as bodies.
async fn exchange(shared: &Shared, step: &str, request: &Request) -> Result<ResponseBody> {
    let response = shared
        .execute(
            request.opcode(),
            request.encode(shared.version),
            shared.config.request_timeout,
        )
        .await
        .map_err(|e| step_failed(step, e))?;

    match response.body {
        ResponseBody::Error(err) => Err(rejected(shared.version, step, err)),
        body => Ok(body),
    }
}

fn step_failed(step: &str, err: WireError) -> WireError {
    match err {
        WireError::UnsupportedProtocolVersion(_)
        | WireError::Authentication(_)
        | WireError::Config(_)
        | WireError::Handshake(_) => err,
        other => WireError::Handshake(format!("{} failed: {}", step, other)),
    }
}

fn rejected(version: ProtocolVersion, step: &str, err: ServerError) -> WireError {
    if err.is_unsupported_version() {
        WireError::UnsupportedProtocolVersion(version.number())
    } else if err.code == codes::BAD_CREDENTIALS {
        WireError::Authentication(err.to_string())
    } else {
        WireError::Handshake(format!("{} rejected: {}", step, err))
    }
}

fn unexpected(step: &str, body: &ResponseBody) -> WireError {
    WireError::Handshake(format!("unexpected {} in response to {}", body.kind(), step))
}
