//! Exchange audit
//!
//! The client reports every frame it puts on or takes off the wire, every
//! state change and every failed transaction to an injected
//! [`ExchangeLogger`]. The last request/response pair is kept separately as
//! an [`Exchange`] for display.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::MasterError;
use crate::types::ClientState;

/// The last request ADU and, when one arrived, its response ADU
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub sent: Vec<u8>,
    pub received: Option<Vec<u8>>,
}

impl Exchange {
    /// Upper-case hex, bytes separated by spaces
    pub fn sent_hex(&self) -> String {
        hex_spaced(&self.sent)
    }

    pub fn received_hex(&self) -> Option<String> {
        self.received.as_deref().map(hex_spaced)
    }
}

pub fn hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sink for protocol traffic and lifecycle events
pub trait ExchangeLogger: Send + Sync {
    fn frame_sent(&self, unit_id: u8, adu: &[u8]);

    fn frame_received(&self, unit_id: u8, adu: &[u8]);

    fn state_changed(&self, from: ClientState, to: ClientState, reason: &str);

    fn transaction_failed(&self, unit_id: u8, error: &MasterError);
}

/// Writes exchanges through `tracing`, tagged with a channel name
#[derive(Debug, Clone)]
pub struct TracingExchangeLogger {
    channel: String,
}

impl TracingExchangeLogger {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    pub fn shared(channel: impl Into<String>) -> Arc<dyn ExchangeLogger> {
        Arc::new(Self::new(channel))
    }
}

impl Default for TracingExchangeLogger {
    fn default() -> Self {
        Self::new("modbus")
    }
}

impl ExchangeLogger for TracingExchangeLogger {
    fn frame_sent(&self, unit_id: u8, adu: &[u8]) {
        debug!(channel = %self.channel, unit_id, "[TX] {}", hex::encode_upper(adu));
    }

    fn frame_received(&self, unit_id: u8, adu: &[u8]) {
        debug!(channel = %self.channel, unit_id, "[RX] {}", hex::encode_upper(adu));
    }

    fn state_changed(&self, from: ClientState, to: ClientState, reason: &str) {
        info!(channel = %self.channel, "[STATUS] {} -> {} - {}", from, to, reason);
    }

    fn transaction_failed(&self, unit_id: u8, error: &MasterError) {
        warn!(channel = %self.channel, unit_id, "[FAIL] {}", error);
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExchangeLogger;

impl ExchangeLogger for NoopExchangeLogger {
    fn frame_sent(&self, _unit_id: u8, _adu: &[u8]) {}

    fn frame_received(&self, _unit_id: u8, _adu: &[u8]) {}

    fn state_changed(&self, _from: ClientState, _to: ClientState, _reason: &str) {}

    fn transaction_failed(&self, _unit_id: u8, _error: &MasterError) {}
}
