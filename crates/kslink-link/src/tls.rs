//! PSK-only TLS 1.3 connector (OpenSSL).
//!
//! Trust is anchored by the pre-shared key: certificate and hostname
//! verification are off, the protocol is pinned to TLS 1.3, session tickets
//! are disabled and key exchange is fixed to P-256.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use openssl::error::ErrorStack;
use openssl::ssl::{SslConnector, SslMethod, SslOptions, SslVerifyMode, SslVersion};
use secrecy::ExposeSecret;
use tracing::debug;

use kslink_core::{Endpoint, KeystoreError, KeystoreResult};

use crate::transport::{Connector, Transport};

const ECDH_GROUP: &str = "P-256";

#[derive(Debug, Clone)]
pub struct PskTlsConnector {
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
}

impl Default for PskTlsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            io_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl PskTlsConnector {
    pub fn new(connect_timeout: Duration, io_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }

    pub fn from_config(client: &kslink_core::config::ClientConfig) -> Self {
        Self::new(client.connect_timeout(), client.io_timeout())
    }

    fn open_tcp(&self, endpoint: &Endpoint) -> KeystoreResult<TcpStream> {
        let fail = |reason: String| KeystoreError::Connection {
            keystore: endpoint.servername.clone(),
            reason,
        };

        let addrs = (endpoint.hostname.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| fail(format!("resolving {}: {e}", endpoint.hostname)))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    let timeouts = stream
                        .set_read_timeout(self.io_timeout)
                        .and_then(|_| stream.set_write_timeout(self.io_timeout));
                    if let Err(e) = timeouts {
                        return Err(fail(format!("configuring socket: {e}")));
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(keystore = %endpoint.servername, %addr, "tcp connect failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(fail(match last_err {
            Some(e) => format!("tcp connect to {}:{}: {e}", endpoint.hostname, endpoint.port),
            None => format!("{} resolved to no addresses", endpoint.hostname),
        }))
    }
}

/// Build the TLS context for one endpoint; the PSK callback answers with the
/// endpoint's identity and secret.
fn build_context(endpoint: &Endpoint) -> Result<SslConnector, ErrorStack> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_groups_list(ECDH_GROUP)?;
    builder.set_options(SslOptions::NO_TICKET);

    let identity = endpoint.psk_identity.clone().into_bytes();
    let psk = endpoint.psk();
    builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
        let secret = psk.expose_secret();
        // identity is written NUL-terminated
        if identity.len() >= identity_out.len() || secret.len() > psk_out.len() {
            return Err(ErrorStack::get());
        }
        identity_out[..identity.len()].copy_from_slice(&identity);
        identity_out[identity.len()] = 0;
        psk_out[..secret.len()].copy_from_slice(secret);
        Ok(secret.len())
    });

    Ok(builder.build())
}

impl Connector for PskTlsConnector {
    fn connect(&self, endpoint: &Endpoint) -> KeystoreResult<Box<dyn Transport>> {
        let handshake_failed = |reason: String| KeystoreError::Connection {
            keystore: endpoint.servername.clone(),
            reason: format!("TLS handshake failed: {reason}"),
        };

        let tcp = self.open_tcp(endpoint)?;
        let connector = build_context(endpoint).map_err(|e| handshake_failed(e.to_string()))?;
        let mut config = connector
            .configure()
            .map_err(|e| handshake_failed(e.to_string()))?;
        config.set_verify_hostname(false);
        config.set_use_server_name_indication(true);

        let stream = config
            .connect(&endpoint.servername, tcp)
            .map_err(|e| handshake_failed(e.to_string()))?;

        debug!(
            keystore = %endpoint.servername,
            host = %endpoint.hostname,
            port = endpoint.port,
            "TLS 1.3 PSK session established"
        );
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn context_builds_with_psk_settings() {
        let endpoint = Endpoint::new("127.0.0.1", 1, "key17.com", vec![1u8; 32]);
        assert!(build_context(&endpoint).is_ok());
    }

    #[test]
    fn refused_tcp_is_connection_error() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::new("127.0.0.1", port, "key17.com", vec![1u8; 32]);
        let connector = PskTlsConnector::new(Duration::from_secs(1), None);

        match connector.connect(&endpoint) {
            Err(KeystoreError::Connection { keystore, .. }) => assert_eq!(keystore, "key17.com"),
            Err(other) => panic!("expected Connection error, got {other:?}"),
            Ok(_) => panic!("connect to a closed port must fail"),
        }
    }
}
