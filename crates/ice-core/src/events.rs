//! Negotiation signals
//!
//! Signals are published on a tokio broadcast channel so call control, UI
//! and tests can each hold their own subscriber.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{IceError, Result};

/// Opaque correlation value supplied by call control, echoed on every signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CallbackToken(pub u64);

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signals emitted toward call control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceEvent {
    /// Candidates are ready to be written into SDP
    GatheringComplete { token: CallbackToken },

    /// TURN allocation failed; call control should invoke `try_another_server`
    GatheringTryingAnother { token: CallbackToken },

    /// Connectivity checks finished
    NominationsComplete { token: CallbackToken, success: bool },
}

impl IceEvent {
    pub fn token(&self) -> CallbackToken {
        match self {
            Self::GatheringComplete { token }
            | Self::GatheringTryingAnother { token }
            | Self::NominationsComplete { token, .. } => *token,
        }
    }
}

/// Subscriber handle for negotiation signals
pub struct IceEventSubscriber {
    receiver: broadcast::Receiver<IceEvent>,
}

impl IceEventSubscriber {
    pub fn new(receiver: broadcast::Receiver<IceEvent>) -> Self {
        Self { receiver }
    }

    /// Receive the next event
    pub async fn receive(&mut self) -> Result<IceEvent> {
        self.receiver
            .recv()
            .await
            .map_err(|e| IceError::internal(format!("Failed to receive event: {}", e)))
    }

    /// Try to receive an event without blocking
    pub fn try_receive(&mut self) -> Result<Option<IceEvent>> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(e) => Err(IceError::internal(format!("Failed to try receive event: {}", e))),
        }
    }
}

/// Publishes negotiation signals to every subscriber
#[derive(Clone)]
pub struct IceEventPublisher {
    sender: broadcast::Sender<IceEvent>,
}

impl fmt::Debug for IceEventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceEventPublisher")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl IceEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> IceEventSubscriber {
        IceEventSubscriber::new(self.sender.subscribe())
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: IceEvent) {
        match event {
            IceEvent::NominationsComplete { token, success } => {
                info!("Nominations complete for token {}: success={}", token, success)
            }
            other => debug!("Publishing {:?}", other),
        }
        let _ = self.sender.send(event);
    }
}
