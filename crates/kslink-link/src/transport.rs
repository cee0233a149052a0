//! Transport seam between a [`KeystoreLink`](crate::KeystoreLink) and the network.

use std::io::{Read, Write};

use kslink_core::{Endpoint, KeystoreResult};

/// A connected, authenticated byte stream to one keystore.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Opens transports. Production uses [`PskTlsConnector`](crate::PskTlsConnector);
/// tests plug in the `mock` feature's connectors.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> KeystoreResult<Box<dyn Transport>>;
}
