//! Subscription handles and per-subscription delivery targets

use meterline_core::{ConnectionId, DeviceId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::domain::TelemetryEvent;

/// Outbound push channel element
pub type EventSender = mpsc::Sender<Arc<TelemetryEvent>>;
pub type EventReceiver = mpsc::Receiver<Arc<TelemetryEvent>>;

/// Identifies one (connection, device) registration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionHandle {
    pub id: u64,
    pub connection_id: ConnectionId,
    pub device_id: DeviceId,
}

/// A routable subscription: the handle plus the owning connection's channel
#[derive(Debug)]
pub(crate) struct Subscriber {
    pub(crate) handle: SubscriptionHandle,
    pub(crate) sender: EventSender,
}

impl Subscriber {
    pub(crate) fn new(handle: SubscriptionHandle, sender: EventSender) -> Self {
        Self { handle, sender }
    }
}

/// Why a subscriber stopped receiving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryFailure {
    /// Receiver dropped
    Closed,
    /// Channel stayed full past the send timeout
    TimedOut,
}

impl DeliveryFailure {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::TimedOut => "timed_out",
        }
    }
}
