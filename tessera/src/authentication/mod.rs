use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Type to represent an authentication error message.
pub type AuthError = String;

/// Trait used to represent a user-defined custom authentication session.
/// The exchange itself runs inside the connection handshake.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Evaluates an authentication challenge from the server,
    /// producing the next token to send, if any.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called when the server indicates successful authentication.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Trait used to represent a factory of [`AuthenticatorSession`] instances.
/// A new session is created for each new connection.
#[async_trait]
pub trait AuthenticatorProvider: Send + Sync {
    /// Called on connection handshake when the server requests
    /// authentication. Returns the initial SASL response and a session
    /// that will drive the rest of the exchange.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during PLAIN authentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Default authenticator provider that sends plaintext username
/// and password in the SASL PLAIN format.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    /// Creates new PlainTextAuthenticator instance with provided
    /// username and password.
    pub fn new(username: String, password: String) -> Self {
        PlainTextAuthenticator { username, password }
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        let mut response = BytesMut::new();
        let username_as_bytes = self.username.as_bytes();
        let password_as_bytes = self.password.as_bytes();

        response.put_u8(0);
        response.put_slice(username_as_bytes);
        response.put_u8(0);
        response.put_slice(password_as_bytes);

        Ok((
            Some(response.to_vec()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plaintext_initial_response_format() {
        let provider = PlainTextAuthenticator::new("cassandra".to_string(), "pass".to_string());
        let (response, _session) = provider
            .start_authentication_session("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();

        let expected = b"\x00cassandra\x00pass".to_vec();
        assert_eq!(response, Some(expected));
    }
}
