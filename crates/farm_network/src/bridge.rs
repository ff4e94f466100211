//! Alert bridge boundary: how the node hands messages to local consumers
//! (dashboard, notifications) and reports alerts it could not deliver.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::Envelope;

/// A message whose relay attempts ran out.
#[derive(Debug, Clone, PartialEq)]
pub struct UndeliverableNotice {
    pub envelope: Envelope,
    pub attempts: u32,
    /// Targets still pending when the node gave up.
    pub unreached: Vec<PeerId>,
}

impl UndeliverableNotice {
    /// The terminal failure this notice represents.
    pub fn error(&self) -> NetworkError {
        NetworkError::DeliveryExhausted {
            message_id: self.envelope.id().to_string(),
            attempts: self.attempts,
        }
    }
}

/// Receiver of local deliveries and undeliverable notices.
///
/// Called from the node's tasks; implementations must not block.
pub trait AlertBridge: Send + Sync {
    /// A new inbound message for this node. Called at most once per id.
    fn deliver_local(&self, envelope: &Envelope);

    /// A message this node gave up relaying.
    fn undeliverable(&self, notice: &UndeliverableNotice);
}

/// Event forwarded by [`ChannelBridge`].
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Delivered(Envelope),
    Undeliverable(UndeliverableNotice),
}

/// Bridge that forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelBridge {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl ChannelBridge {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertBridge for ChannelBridge {
    fn deliver_local(&self, envelope: &Envelope) {
        if self.tx.send(BridgeEvent::Delivered(envelope.clone())).is_err() {
            warn!("Bridge receiver gone, dropping delivery of {}", envelope.id());
        }
    }

    fn undeliverable(&self, notice: &UndeliverableNotice) {
        if self
            .tx
            .send(BridgeEvent::Undeliverable(notice.clone()))
            .is_err()
        {
            warn!("Bridge receiver gone, dropping notice for {}", notice.envelope.id());
        }
    }
}

/// Bridge that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBridge;

impl AlertBridge for LogBridge {
    fn deliver_local(&self, envelope: &Envelope) {
        info!("{} {} from {}", envelope.kind(), envelope.id(), envelope.origin());
    }

    fn undeliverable(&self, notice: &UndeliverableNotice) {
        warn!("{}", notice.error());
    }
}
