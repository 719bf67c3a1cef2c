//! Public DNS proxy facade
//!
//! Owns the forwarder and exposes the embedding surface: initialize with
//! settings and callbacks, feed raw messages in, get raw responses out, shut
//! down cooperatively. Wire listeners are the embedder's business; they call
//! [`DnsProxy::handle_message`] with whatever arrives on their sockets.

use std::sync::Arc;

use crate::config::{DnsMessageInfo, DnsProxySettings};
use crate::error::InitError;
use crate::events::DnsProxyEvents;
use crate::forwarder::DnsForwarder;

/// A running filtering DNS forwarding proxy
pub struct DnsProxy {
    forwarder: Arc<DnsForwarder>,
}

impl DnsProxy {
    /// Initialize the proxy module
    ///
    /// Must run inside a Tokio runtime: background tasks (DNS64 discovery,
    /// optimistic cache refreshes) are spawned on it.
    pub async fn init(
        settings: DnsProxySettings,
        events: DnsProxyEvents,
    ) -> Result<Self, InitError> {
        log::info!("initializing proxy module");
        let forwarder = DnsForwarder::init(settings, events).await?;
        log::info!("proxy module initialized");
        Ok(Self { forwarder })
    }

    /// Effective settings of this proxy instance
    pub fn settings(&self) -> &DnsProxySettings {
        self.forwarder.settings()
    }

    /// Process one client message and return the encoded response
    ///
    /// An empty result means "do not reply" (suppressed retransmission,
    /// upstream failure with SERVFAIL synthesis disabled, or shutdown).
    pub async fn handle_message(&self, message: &[u8], info: Option<&DnsMessageInfo>) -> Vec<u8> {
        self.forwarder.handle_message(message, info).await
    }

    /// Cooperative shutdown: in-flight tasks observe the expired token and
    /// finish without publishing state
    pub fn deinit(&self) {
        log::info!("deinitializing proxy module");
        self.forwarder.deinit();
        log::info!("proxy module deinitialized");
    }
}

impl Drop for DnsProxy {
    fn drop(&mut self) {
        self.forwarder.deinit();
    }
}
