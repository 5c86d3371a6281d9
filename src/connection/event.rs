use std::time::Duration;

use crate::codec::Publish;

/// Who ended a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectSource {
    /// The application called disconnect.
    User,
    /// The client gave up on the connection (I/O error, keep-alive timeout,
    /// malformed packet, protocol violation).
    Client,
    /// The broker closed the connection or refused it.
    Server,
}

/// Notifications from the connection task to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected {
        session_present: bool,
    },
    /// A message arrived on one of the subscriptions.
    Message(Publish),
    Disconnected {
        source: DisconnectSource,
        /// Human readable reason; `None` for an orderly disconnect.
        cause: Option<String>,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// An outgoing QoS 1/2 publish ran out of retries.
    PublishFailed {
        packet_id: u16,
    },
}
