use std::time::Duration;

use thiserror::Error;

pub type KeystoreResult<T> = Result<T, KeystoreError>;

/// Every failure a keystore operation can surface.
///
/// `Clone` so a failed request can hand the same error to every reader.
#[derive(Debug, Clone, Error)]
pub enum KeystoreError {
    /// TCP connect or TLS handshake failed
    #[error("connection to {keystore} failed: {reason}")]
    Connection { keystore: String, reason: String },

    /// The keystore answered a well-formed command with `ERROR...`
    #[error("{keystore}: {operation} rejected by keystore: {response}")]
    Protocol {
        keystore: String,
        operation: String,
        response: String,
    },

    /// The response matched no known pattern
    #[error("{keystore}: unexpected response to {operation}: {response}")]
    UnexpectedResponse {
        keystore: String,
        operation: String,
        response: String,
    },

    /// Peer closed the connection (idle timeout on the keystore side)
    #[error("{0}: connection closed by keystore")]
    ConnectionClosed(String),

    /// The single reconnect-and-resend after an idle close also failed
    #[error("{keystore}: reconnect failed: {source}")]
    ReconnectFailed {
        keystore: String,
        #[source]
        source: Box<KeystoreError>,
    },

    #[error("keystore not registered: {0}")]
    Lookup(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Bad index, payload length or blob size, rejected before any I/O
    #[error("invalid input: {0}")]
    Input(String),

    /// The owning worker stopped before the request ran
    #[error("{0}: worker stopped")]
    WorkerStopped(String),

    #[error("config error: {0}")]
    Config(String),
}

impl KeystoreError {
    pub fn input(msg: impl Into<String>) -> Self {
        KeystoreError::Input(msg.into())
    }

    /// True for failures caused by the transport rather than the keystore's answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            KeystoreError::Connection { .. }
                | KeystoreError::ConnectionClosed(_)
                | KeystoreError::ReconnectFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_failed_keeps_cause() {
        let err = KeystoreError::ReconnectFailed {
            keystore: "key17.com".into(),
            source: Box::new(KeystoreError::Connection {
                keystore: "key17.com".into(),
                reason: "refused".into(),
            }),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("reconnect failed"));
        assert!(rendered.contains("refused"));
        assert!(err.is_transport());
    }

    #[test]
    fn protocol_errors_are_not_transport() {
        let err = KeystoreError::Protocol {
            keystore: "key9.com".into(),
            operation: "read record 01".into(),
            response: "ERROR".into(),
        };
        assert!(!err.is_transport());
    }
}
