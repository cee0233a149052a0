//! kslink-link: one keystore connection over PSK-authenticated TLS 1.3
//!
//! ```text
//! KeystoreLink ── send_command ──► Connector::connect ──► Box<dyn Transport>
//!                    │                   │
//!                    │                   ├── PskTlsConnector   (OpenSSL, production)
//!                    │                   └── mock::*           (feature = "mock")
//!                    └── wire::*  frame builders + response classification
//! ```

pub mod link;
pub mod tls;
pub mod transport;
pub mod wire;

#[cfg(feature = "mock")]
pub mod mock;

pub use link::KeystoreLink;
pub use tls::PskTlsConnector;
pub use transport::{Connector, Transport};
pub use wire::Direction;
