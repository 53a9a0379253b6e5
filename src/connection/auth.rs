//! Pluggable SASL-style authentication.
//!
//! When STARTUP is answered with AUTHENTICATE, the connection asks its
//! [`AuthProvider`] for a fresh [`Authenticator`] and relays tokens between
//! it and the server until AUTH_SUCCESS or an error.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;

/// One authentication exchange. Lives for a single handshake.
pub trait Authenticator: Send {
    /// Token for the first AUTH_RESPONSE.
    fn initial_response(&mut self) -> Result<Option<Bytes>>;

    /// Answer a server challenge.
    fn evaluate_challenge(&mut self, challenge: Option<&[u8]>) -> Result<Option<Bytes>>;

    /// Called with the final token on AUTH_SUCCESS.
    fn on_success(&mut self, _token: Option<&[u8]>) -> Result<()> {
        Ok(())
    }
}

/// Creates authenticators; shared across connections.
pub trait AuthProvider: Send + Sync + fmt::Debug {
    /// New exchange for the server-side authenticator class `authenticator`.
    fn new_authenticator(&self, authenticator: &str) -> Result<Box<dyn Authenticator>>;
}

/// Username/password provider (SASL PLAIN).
#[derive(Clone)]
pub struct PlainTextAuthProvider {
    username: String,
    password: String,
}

impl PlainTextAuthProvider {
    /// Provider sending `username` and `password`.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for PlainTextAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainTextAuthProvider")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AuthProvider for PlainTextAuthProvider {
    fn new_authenticator(&self, authenticator: &str) -> Result<Box<dyn Authenticator>> {
        tracing::debug!(authenticator, "using plain-text authentication");
        Ok(Box::new(PlainTextAuthenticator {
            token: plain_token(&self.username, &self.password),
        }))
    }
}

/// `\0username\0password`
fn plain_token(username: &str, password: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(username.len() + password.len() + 2);
    buf.put_u8(0);
    buf.put_slice(username.as_bytes());
    buf.put_u8(0);
    buf.put_slice(password.as_bytes());
    buf.freeze()
}

struct PlainTextAuthenticator {
    token: Bytes,
}

impl Authenticator for PlainTextAuthenticator {
    fn initial_response(&mut self) -> Result<Option<Bytes>> {
        Ok(Some(self.token.clone()))
    }

    fn evaluate_challenge(&mut self, _challenge: Option<&[u8]>) -> Result<Option<Bytes>> {
        // PLAIN has a single round; resend the credentials.
        Ok(Some(self.token.clone()))
    }
}
