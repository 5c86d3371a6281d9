//! The `session` module holds the protocol state that outlives a single
//! network connection.
//!
//! A [`Session`] allocates packet identifiers, tracks outgoing QoS 1 and
//! QoS 2 flows until they complete, remembers incoming QoS 2 identifiers for
//! duplicate suppression and keeps the table of granted subscriptions. It is
//! owned by the connection task and never shared; every method takes the
//! current time in milliseconds so timing can be driven from tests.

pub mod inflight;
mod packet_id;
mod persistence;
mod subscriptions;


use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::codec::{
    Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck, Subscribe, SubscribeFilter,
    SubscribeReturnCode, Unsubscribe, topic,
};
use crate::config::SessionSettings;
use crate::utils::error::{Error, Result};

pub use inflight::{FlowState, OutgoingFlow};
pub(crate) use inflight::{PublishResponder, SubscribeResponder, UnsubscribeResponder};
use inflight::{PendingAck, PendingKind};
pub use packet_id::PacketIdAllocator;
pub use persistence::{FlowStore, StoredFlow};
pub use subscriptions::SubscriptionTable;

/// Outcome of a retry pass.
#[derive(Debug, Default)]
pub struct Expiry {
    /// Packets to write again, oldest flow first.
    pub resend: Vec<Packet>,
    /// Publishes that ran out of retries.
    pub failed_publishes: Vec<u16>,
    /// SUBSCRIBE/UNSUBSCRIBE identifiers that timed out or were cancelled.
    pub released: Vec<u16>,
}

/// What to do with a PUBLISH received from the broker.
#[derive(Debug, PartialEq, Eq)]
pub struct IncomingPublish {
    /// False for a redelivered QoS 2 message the application already has.
    pub deliver: bool,
    pub reply: Option<Packet>,
}

pub struct Session {
    packet_ids: PacketIdAllocator,
    outgoing: HashMap<u16, OutgoingFlow>,
    pending: HashMap<u16, PendingAck>,
    incoming_qos2: HashSet<u16>,
    subscriptions: SubscriptionTable,
    store: Option<FlowStore>,
    next_seq: u64,
    retry_interval_ms: i64,
    ack_timeout_ms: i64,
    max_retries: u8,
}

impl Session {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            packet_ids: PacketIdAllocator::new(),
            outgoing: HashMap::new(),
            pending: HashMap::new(),
            incoming_qos2: HashSet::new(),
            subscriptions: SubscriptionTable::new(),
            store: None,
            next_seq: 0,
            retry_interval_ms: i64::try_from(settings.retry_interval_ms).unwrap_or(i64::MAX),
            ack_timeout_ms: i64::try_from(settings.ack_timeout_ms).unwrap_or(i64::MAX),
            max_retries: settings.max_retries,
        }
    }

    /// A session backed by `store`, resuming every flow found in it.
    pub fn with_store(settings: &SessionSettings, store: FlowStore) -> Result<Self> {
        let mut session = Self::new(settings);
        for stored in store.load_all()? {
            let state = match (stored.qos, stored.released) {
                (QoS::AtMostOnce, _) => {
                    store.discard(stored.packet_id)?;
                    continue;
                }
                (QoS::AtLeastOnce, _) => FlowState::AwaitingPubAck,
                (QoS::ExactlyOnce, false) => FlowState::AwaitingPubRec,
                (QoS::ExactlyOnce, true) => FlowState::AwaitingPubComp,
            };
            if !session.packet_ids.reserve(stored.packet_id) {
                warn!(packet_id = stored.packet_id, "skipping stored flow with unusable packet id");
                continue;
            }
            session.next_seq = session.next_seq.max(stored.seq + 1);
            session.outgoing.insert(
                stored.packet_id,
                OutgoingFlow {
                    publish: stored.to_publish(),
                    state,
                    sent_at: 0,
                    retries: 0,
                    seq: stored.seq,
                    responder: None,
                },
            );
        }
        debug!(flows = session.outgoing.len(), "restored outgoing flows");
        session.store = Some(store);
        Ok(session)
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn flow(&self, packet_id: u16) -> Option<&OutgoingFlow> {
        self.outgoing.get(&packet_id)
    }

    pub fn inflight_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn packet_ids_in_use(&self) -> usize {
        self.packet_ids.in_use()
    }

    /// Whether an incoming QoS 2 message with this id awaits its PUBREL.
    pub fn awaiting_pubrel(&self, packet_id: u16) -> bool {
        self.incoming_qos2.contains(&packet_id)
    }

    /// Build the PUBLISH for an application message. QoS 1 and 2 messages
    /// get a packet identifier and are tracked until acknowledged.
    pub fn start_publish(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        now: i64,
    ) -> Result<Publish> {
        if !topic::valid_topic_name(&topic) {
            return Err(Error::InvalidTopic(topic));
        }
        let mut publish = Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id: None,
            payload,
        };
        if qos == QoS::AtMostOnce {
            return Ok(publish);
        }

        let packet_id = self.packet_ids.allocate().ok_or(Error::PacketIdsExhausted)?;
        publish.packet_id = Some(packet_id);
        let seq = self.next_seq;
        if let Some(store) = &self.store {
            if let Err(err) = store.store_publish(&publish, seq) {
                self.packet_ids.release(packet_id);
                return Err(err);
            }
        }
        self.next_seq += 1;
        let state = if qos == QoS::AtLeastOnce {
            FlowState::AwaitingPubAck
        } else {
            FlowState::AwaitingPubRec
        };
        self.outgoing.insert(
            packet_id,
            OutgoingFlow {
                publish: publish.clone(),
                state,
                sent_at: now,
                retries: 0,
                seq,
                responder: None,
            },
        );
        Ok(publish)
    }

    pub fn start_subscribe(&mut self, filters: Vec<SubscribeFilter>, now: i64) -> Result<Subscribe> {
        if filters.is_empty() {
            return Err(Error::InvalidTopic("no topic filters given".into()));
        }
        if let Some(bad) = filters.iter().find(|f| !topic::valid_topic_filter(&f.filter)) {
            return Err(Error::InvalidTopic(bad.filter.clone()));
        }
        let packet_id = self.packet_ids.allocate().ok_or(Error::PacketIdsExhausted)?;
        self.pending.insert(
            packet_id,
            PendingAck {
                kind: PendingKind::Subscribe {
                    filters: filters.clone(),
                    responder: None,
                },
                sent_at: now,
            },
        );
        Ok(Subscribe { packet_id, filters })
    }

    pub fn start_unsubscribe(&mut self, filters: Vec<String>, now: i64) -> Result<Unsubscribe> {
        if filters.is_empty() {
            return Err(Error::InvalidTopic("no topic filters given".into()));
        }
        if let Some(bad) = filters.iter().find(|f| !topic::valid_topic_filter(f)) {
            return Err(Error::InvalidTopic(bad.clone()));
        }
        let packet_id = self.packet_ids.allocate().ok_or(Error::PacketIdsExhausted)?;
        self.pending.insert(
            packet_id,
            PendingAck {
                kind: PendingKind::Unsubscribe {
                    filters: filters.clone(),
                    responder: None,
                },
                sent_at: now,
            },
        );
        Ok(Unsubscribe { packet_id, filters })
    }

    pub(crate) fn attach_publish_responder(&mut self, packet_id: u16, responder: PublishResponder) {
        match self.outgoing.get_mut(&packet_id) {
            Some(flow) => flow.responder = Some(responder),
            None => {
                let _ = responder.send(Err(Error::NotConnected));
            }
        }
    }

    pub(crate) fn attach_subscribe_responder(
        &mut self,
        packet_id: u16,
        tx: SubscribeResponder,
    ) {
        if let Some(PendingAck {
            kind: PendingKind::Subscribe { responder, .. },
            ..
        }) = self.pending.get_mut(&packet_id)
        {
            *responder = Some(tx);
        }
    }

    pub(crate) fn attach_unsubscribe_responder(
        &mut self,
        packet_id: u16,
        tx: UnsubscribeResponder,
    ) {
        if let Some(PendingAck {
            kind: PendingKind::Unsubscribe { responder, .. },
            ..
        }) = self.pending.get_mut(&packet_id)
        {
            *responder = Some(tx);
        }
    }

    /// Forget an exchange whose first packet could not be sent at all.
    pub fn abort(&mut self, packet_id: u16) {
        if self.outgoing.remove(&packet_id).is_some() {
            self.discard_stored(packet_id);
        }
        self.pending.remove(&packet_id);
        self.packet_ids.release(packet_id);
    }

    /// Returns whether a flow was completed.
    pub fn handle_puback(&mut self, packet_id: u16) -> Result<bool> {
        match self.outgoing.get(&packet_id).map(|flow| flow.state) {
            Some(FlowState::AwaitingPubAck) => {
                self.finish_flow(packet_id, Ok(()));
                Ok(true)
            }
            Some(state) => Err(Error::ProtocolViolation(format!(
                "PUBACK for packet {packet_id} in state {state:?}"
            ))),
            None => {
                debug!(packet_id, "PUBACK for unknown packet id");
                Ok(false)
            }
        }
    }

    /// Moves a QoS 2 flow to its release phase; the returned PUBREL must be sent.
    pub fn handle_pubrec(&mut self, packet_id: u16, now: i64) -> Result<Packet> {
        let pubrel = Packet::PubRel(PubRel { packet_id });
        let Some(flow) = self.outgoing.get_mut(&packet_id) else {
            debug!(packet_id, "PUBREC for unknown packet id");
            return Ok(pubrel);
        };
        match flow.state {
            FlowState::AwaitingPubRec => {
                flow.state = FlowState::AwaitingPubComp;
                flow.sent_at = now;
                flow.retries = 0;
                if let Some(store) = &self.store {
                    // a stale record would replay the PUBLISH after a restart
                    if let Err(err) = store.store_pubrel(packet_id) {
                        warn!(packet_id, error = %err, "failed to persist PUBREL state, dropping stored flow");
                        if let Err(err) = store.discard(packet_id) {
                            warn!(packet_id, error = %err, "failed to discard stored flow");
                        }
                    }
                }
                Ok(pubrel)
            }
            FlowState::AwaitingPubComp => Ok(pubrel),
            FlowState::AwaitingPubAck => Err(Error::ProtocolViolation(format!(
                "PUBREC for QoS 1 packet {packet_id}"
            ))),
        }
    }

    pub fn handle_pubcomp(&mut self, packet_id: u16) -> Result<bool> {
        match self.outgoing.get(&packet_id).map(|flow| flow.state) {
            Some(FlowState::AwaitingPubComp) => {
                self.finish_flow(packet_id, Ok(()));
                Ok(true)
            }
            Some(state) => Err(Error::ProtocolViolation(format!(
                "PUBCOMP for packet {packet_id} in state {state:?}"
            ))),
            None => {
                debug!(packet_id, "PUBCOMP for unknown packet id");
                Ok(false)
            }
        }
    }

    /// Records the granted filters and answers the subscriber.
    pub fn handle_suback(&mut self, suback: SubAck) -> Result<bool> {
        let packet_id = suback.packet_id;
        let Some(pending) = self.pending.remove(&packet_id) else {
            debug!(packet_id, "SUBACK for unknown packet id");
            return Ok(false);
        };
        self.packet_ids.release(packet_id);
        let PendingKind::Subscribe { filters, responder } = pending.kind else {
            return Err(Error::ProtocolViolation(format!(
                "SUBACK for UNSUBSCRIBE packet {packet_id}"
            )));
        };
        if filters.len() != suback.return_codes.len() {
            return Err(Error::ProtocolViolation(format!(
                "SUBACK for packet {packet_id} carries {} return codes for {} filters",
                suback.return_codes.len(),
                filters.len()
            )));
        }
        for (filter, code) in filters.iter().zip(&suback.return_codes) {
            match code {
                SubscribeReturnCode::Success(granted) => {
                    self.subscriptions.insert(filter.filter.clone(), *granted);
                }
                SubscribeReturnCode::Failure => {
                    warn!(filter = %filter.filter, "broker rejected subscription");
                    self.subscriptions.remove(&filter.filter);
                }
            }
        }
        if let Some(tx) = responder {
            let _ = tx.send(Ok(suback.return_codes));
        }
        Ok(true)
    }

    pub fn handle_unsuback(&mut self, packet_id: u16) -> Result<bool> {
        let Some(pending) = self.pending.remove(&packet_id) else {
            debug!(packet_id, "UNSUBACK for unknown packet id");
            return Ok(false);
        };
        self.packet_ids.release(packet_id);
        let PendingKind::Unsubscribe { filters, responder } = pending.kind else {
            return Err(Error::ProtocolViolation(format!(
                "UNSUBACK for SUBSCRIBE packet {packet_id}"
            )));
        };
        for filter in &filters {
            self.subscriptions.remove(filter);
        }
        if let Some(tx) = responder {
            let _ = tx.send(Ok(()));
        }
        Ok(true)
    }

    pub fn handle_incoming_publish(&mut self, publish: &Publish) -> IncomingPublish {
        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => IncomingPublish {
                deliver: true,
                reply: Some(Packet::PubAck(PubAck { packet_id })),
            },
            (QoS::ExactlyOnce, Some(packet_id)) => IncomingPublish {
                deliver: self.incoming_qos2.insert(packet_id),
                reply: Some(Packet::PubRec(PubRec { packet_id })),
            },
            _ => IncomingPublish {
                deliver: true,
                reply: None,
            },
        }
    }

    /// Ends the receive side of a QoS 2 exchange. PUBCOMP is sent even for
    /// unknown identifiers so the broker can finish.
    pub fn handle_incoming_pubrel(&mut self, packet_id: u16) -> Packet {
        if !self.incoming_qos2.remove(&packet_id) {
            debug!(packet_id, "PUBREL for unknown packet id");
        }
        Packet::PubComp(PubComp { packet_id })
    }

    /// Resend overdue flows, fail the ones out of retries and drop
    /// subscribe/unsubscribe requests that timed out or were abandoned.
    pub fn expire(&mut self, now: i64) -> Expiry {
        let mut expiry = Expiry::default();

        let mut overdue: Vec<(u64, u16)> = self
            .outgoing
            .values()
            .filter(|flow| now.saturating_sub(flow.sent_at) >= self.retry_interval_ms)
            .map(|flow| (flow.seq, flow.packet_id()))
            .collect();
        overdue.sort_unstable();
        for (_, packet_id) in overdue {
            let Some(flow) = self.outgoing.get_mut(&packet_id) else {
                continue;
            };
            if flow.retries >= self.max_retries {
                warn!(packet_id, retries = flow.retries, "giving up on unacknowledged publish");
                self.finish_flow(packet_id, Err(Error::AckTimeout { packet_id }));
                expiry.failed_publishes.push(packet_id);
            } else {
                flow.retries += 1;
                flow.sent_at = now;
                debug!(packet_id, retry = flow.retries, "retransmitting");
                expiry.resend.push(flow.retransmission());
            }
        }

        let done: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, pending)| {
                pending.is_cancelled() || now.saturating_sub(pending.sent_at) >= self.ack_timeout_ms
            })
            .map(|(packet_id, _)| *packet_id)
            .collect();
        for packet_id in done {
            if let Some(pending) = self.pending.remove(&packet_id) {
                self.packet_ids.release(packet_id);
                if pending.is_cancelled() {
                    debug!(packet_id, "request cancelled, releasing packet id");
                } else {
                    pending.fail(Error::AckTimeout { packet_id });
                }
                expiry.released.push(packet_id);
            }
        }
        expiry
    }

    /// Session bookkeeping after a CONNACK; returns what must be sent before
    /// any new traffic. A clean session drops every outstanding flow but
    /// keeps the subscription table: whenever the broker reports no session,
    /// clean or not, the acknowledged subscriptions are requested again.
    pub fn on_connected(&mut self, clean_session: bool, session_present: bool, now: i64) -> Vec<Packet> {
        if clean_session {
            self.discard_flows();
        }
        let mut packets = self.retransmissions(now);
        if !session_present && !self.subscriptions.is_empty() {
            match self.start_subscribe(self.subscriptions.to_filters(), now) {
                Ok(subscribe) => packets.push(Packet::Subscribe(subscribe)),
                Err(err) => warn!(error = %err, "unable to restore subscriptions"),
            }
        }
        packets
    }

    /// Pending SUBSCRIBE/UNSUBSCRIBE are not resent on a new connection, so
    /// they fail when the current one is lost. Publish flows survive.
    pub fn on_connection_lost(&mut self) {
        for (packet_id, pending) in self.pending.drain() {
            self.packet_ids.release(packet_id);
            pending.fail(Error::NotConnected);
        }
    }

    /// Fail every waiting caller. Stored flows stay in the store.
    pub fn close(&mut self) {
        self.on_connection_lost();
        for (packet_id, flow) in self.outgoing.drain() {
            self.packet_ids.release(packet_id);
            flow.complete(Err(Error::NotConnected));
        }
    }

    fn retransmissions(&mut self, now: i64) -> Vec<Packet> {
        let mut flows: Vec<&mut OutgoingFlow> = self.outgoing.values_mut().collect();
        flows.sort_unstable_by_key(|flow| flow.seq);
        flows
            .into_iter()
            .map(|flow| {
                flow.sent_at = now;
                flow.retransmission()
            })
            .collect()
    }

    fn discard_flows(&mut self) {
        for (packet_id, flow) in self.outgoing.drain() {
            self.packet_ids.release(packet_id);
            flow.complete(Err(Error::SessionDiscarded));
        }
        self.incoming_qos2.clear();
        if let Some(store) = &self.store {
            if let Err(err) = store.clear() {
                warn!(error = %err, "failed to clear flow store");
            }
        }
    }

    fn finish_flow(&mut self, packet_id: u16, result: Result<()>) {
        if let Some(flow) = self.outgoing.remove(&packet_id) {
            self.packet_ids.release(packet_id);
            self.discard_stored(packet_id);
            flow.complete(result);
        }
    }

    fn discard_stored(&self, packet_id: u16) {
        if let Some(store) = &self.store {
            if let Err(err) = store.discard(packet_id) {
                warn!(packet_id, error = %err, "failed to discard stored flow");
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("outgoing", &self.outgoing.len())
            .field("pending", &self.pending.len())
            .field("incoming_qos2", &self.incoming_qos2.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("store", &self.store)
            .finish()
    }
}
