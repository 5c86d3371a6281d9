//! In-flight exchange records.

use tokio::sync::oneshot;

use crate::codec::{Packet, PubRel, Publish, SubscribeFilter, SubscribeReturnCode};
use crate::utils::error::{Error, Result};

pub(crate) type PublishResponder = oneshot::Sender<Result<()>>;
pub(crate) type SubscribeResponder = oneshot::Sender<Result<Vec<SubscribeReturnCode>>>;
pub(crate) type UnsubscribeResponder = oneshot::Sender<Result<()>>;

/// What an outgoing QoS 1/2 publish is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

#[derive(Debug)]
pub struct OutgoingFlow {
    pub publish: Publish,
    pub state: FlowState,
    /// Milliseconds since the epoch of the last (re)transmission.
    pub sent_at: i64,
    pub retries: u8,
    pub(crate) seq: u64,
    pub(crate) responder: Option<PublishResponder>,
}

impl OutgoingFlow {
    pub fn packet_id(&self) -> u16 {
        self.publish.packet_id.unwrap_or_default()
    }

    /// The packet to resend: the PUBLISH with DUP set, or the PUBREL once
    /// the broker has acknowledged receipt.
    pub fn retransmission(&self) -> Packet {
        match self.state {
            FlowState::AwaitingPubComp => Packet::PubRel(PubRel {
                packet_id: self.packet_id(),
            }),
            FlowState::AwaitingPubAck | FlowState::AwaitingPubRec => {
                let mut publish = self.publish.clone();
                publish.dup = true;
                Packet::Publish(publish)
            }
        }
    }

    pub(crate) fn complete(mut self, result: Result<()>) {
        if let Some(responder) = self.responder.take() {
            // the caller may have stopped waiting
            let _ = responder.send(result);
        }
    }
}

#[derive(Debug)]
pub(crate) enum PendingKind {
    Subscribe {
        filters: Vec<SubscribeFilter>,
        responder: Option<SubscribeResponder>,
    },
    Unsubscribe {
        filters: Vec<String>,
        responder: Option<UnsubscribeResponder>,
    },
}

/// A SUBSCRIBE or UNSUBSCRIBE waiting for its acknowledgement.
#[derive(Debug)]
pub(crate) struct PendingAck {
    pub(crate) kind: PendingKind,
    pub(crate) sent_at: i64,
}

impl PendingAck {
    /// The requester dropped its end; internal requests are never cancelled.
    pub(crate) fn is_cancelled(&self) -> bool {
        match &self.kind {
            PendingKind::Subscribe {
                responder: Some(tx),
                ..
            } => tx.is_closed(),
            PendingKind::Unsubscribe {
                responder: Some(tx),
                ..
            } => tx.is_closed(),
            _ => false,
        }
    }

    pub(crate) fn fail(self, err: Error) {
        match self.kind {
            PendingKind::Subscribe {
                responder: Some(tx),
                ..
            } => {
                let _ = tx.send(Err(err));
            }
            PendingKind::Unsubscribe {
                responder: Some(tx),
                ..
            } => {
                let _ = tx.send(Err(err));
            }
            _ => {}
        }
    }
}
