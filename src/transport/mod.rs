use crate::error::{Result, TransportError};
use crate::protocol::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod channel;
pub mod stdio;

pub use channel::{ChannelTransport, ClientHandle};
pub use stdio::StdioTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Stdio,
    Channel,
}

/// Callbacks a transport drives. Implemented by the dispatcher.
#[async_trait]
pub trait TransportEvents: Send + Sync + 'static {
    async fn on_connect(&self, client_id: &str);
    async fn on_disconnect(&self, client_id: &str);
    /// Called once per inbound envelope, in arrival order for a client.
    async fn on_message(&self, client_id: &str, envelope: Envelope);
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn start(&self, events: Arc<dyn TransportEvents>) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn send(&self, client_id: &str, envelope: Envelope) -> Result<()>;

    /// Connectionless transports keep this default.
    async fn broadcast(&self, _envelope: Envelope) -> Result<()> {
        Err(TransportError::Unsupported("broadcast").into())
    }

    fn transport_type(&self) -> TransportType;
}

pub fn create_transport(config: &crate::config::TransportConfig) -> Arc<dyn Transport> {
    match config {
        crate::config::TransportConfig::Stdio => Arc::new(StdioTransport::new()),
        crate::config::TransportConfig::Channel => Arc::new(ChannelTransport::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    #[tokio::test]
    async fn test_create_transport_from_config() {
        let transport = create_transport(&TransportConfig::Channel);
        assert_eq!(transport.transport_type(), TransportType::Channel);

        let transport = create_transport(&TransportConfig::default());
        assert_eq!(transport.transport_type(), TransportType::Stdio);
    }
}
