//! The connection task.
//!
//! One task owns the transport channel, the [`Session`] and the keep-alive
//! timer. Everything else talks to it through a request channel and hears
//! back through one-shot replies and the event stream, so writes to the
//! broker are serialized by construction.
//!
//! While connected the task multiplexes four sources with `select!`:
//! bytes from the broker, application requests, the keep-alive deadline
//! and a retry tick that drives retransmission and acknowledgement
//! timeouts. When the connection is lost the reconnect policy decides
//! whether there is another attempt; requests that arrive while waiting
//! are rejected with [`Error::NotConnected`].

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::event::{DisconnectSource, Event};
use super::keepalive::{KeepAlive, KeepAliveAction};
use super::reconnect::ReconnectPolicy;
use super::state::{ConnectionState, StateMachine};
use crate::codec::{Connect, LastWill, MqttCodec, Packet, QoS, SubscribeFilter};
use crate::config::Settings;
use crate::session::{PublishResponder, Session, SubscribeResponder, UnsubscribeResponder};
use crate::transport::{self, Channel};
use crate::utils::error::{Error, Result};

const READ_BUFFER_SIZE: usize = 4 * 1024;

/// Application requests handled by the connection task.
pub(crate) enum Request {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        resp: PublishResponder,
    },
    Subscribe {
        filters: Vec<SubscribeFilter>,
        resp: SubscribeResponder,
    },
    Unsubscribe {
        filters: Vec<String>,
        resp: UnsubscribeResponder,
    },
    Disconnect {
        resp: oneshot::Sender<Result<()>>,
    },
}

impl Request {
    fn reject(self, err: Error) {
        match self {
            Request::Publish { resp, .. } => {
                let _ = resp.send(Err(err));
            }
            Request::Subscribe { resp, .. } => {
                let _ = resp.send(Err(err));
            }
            Request::Unsubscribe { resp, .. } => {
                let _ = resp.send(Err(err));
            }
            Request::Disconnect { resp } => {
                let _ = resp.send(Err(err));
            }
        }
    }
}

/// How a served connection ended.
enum End {
    /// Orderly disconnect, or every client handle was dropped.
    Stopped,
    Lost(Error),
}

/// An established connection: the channel plus bytes already read past
/// the CONNACK.
struct Link {
    channel: Channel,
    buf: BytesMut,
    keepalive: KeepAlive,
}

pub(crate) struct ConnectionTask {
    settings: Settings,
    connect: Connect,
    codec: MqttCodec,
    session: Session,
    state: StateMachine,
    requests: mpsc::Receiver<Request>,
    events: mpsc::UnboundedSender<Event>,
    policy: Box<dyn ReconnectPolicy>,
}

impl ConnectionTask {
    pub(crate) fn new(
        settings: Settings,
        client_id: String,
        session: Session,
        state: StateMachine,
        requests: mpsc::Receiver<Request>,
        events: mpsc::UnboundedSender<Event>,
        policy: Box<dyn ReconnectPolicy>,
    ) -> Result<Self> {
        let broker = &settings.broker;
        let last_will = match &broker.last_will {
            Some(will) => Some(LastWill {
                topic: will.topic.clone(),
                payload: Bytes::from(will.payload.clone()),
                qos: QoS::try_from(will.qos)?,
                retain: will.retain,
            }),
            None => None,
        };
        let connect = Connect {
            client_id,
            keep_alive: broker.keep_alive_secs,
            clean_session: broker.clean_session,
            username: broker.username.clone(),
            password: broker.password.clone().map(Bytes::from),
            last_will,
        };
        let codec = MqttCodec::new(broker.max_packet_size);
        Ok(Self {
            settings,
            connect,
            codec,
            session,
            state,
            requests,
            events,
            policy,
        })
    }

    /// Connect, serve and reconnect until told to stop. `ready` receives the
    /// outcome of the first attempt (the session-present flag on success);
    /// a first attempt that fails is not retried.
    pub(crate) async fn run(mut self, ready: oneshot::Sender<Result<bool>>) {
        let mut ready = Some(ready);
        let mut attempt = 0u32;

        loop {
            let cause = match self.connect().await {
                Ok((link, session_present)) => {
                    attempt = 0;
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(session_present));
                    }
                    match self.serve(link, session_present).await {
                        End::Stopped => break,
                        End::Lost(cause) => cause,
                    }
                }
                Err(err) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(err));
                        break;
                    }
                    err
                }
            };

            if self.state.current().is_terminal() {
                break;
            }
            attempt = attempt.saturating_add(1);
            let Some(delay) = self.policy.next_delay(attempt, &cause) else {
                info!(error = %cause, "not reconnecting");
                break;
            };
            info!(attempt, ?delay, error = %cause, "reconnecting");
            self.emit(Event::Reconnecting { attempt, delay });
            if !self.wait_before_reconnect(delay).await {
                break;
            }
        }

        self.session.close();
        debug!(state = %self.state.current(), "connection task finished");
    }

    /// Open the transport and run the CONNECT/CONNACK exchange.
    async fn connect(&mut self) -> Result<(Link, bool)> {
        self.state.transition(ConnectionState::Connecting)?;
        let result = self.handshake().await;
        if let Err(err) = &result {
            let (next, source) = match err {
                Error::ConnectionRefused(_) => (ConnectionState::Failed, DisconnectSource::Server),
                err if err.is_fatal() => (ConnectionState::Failed, DisconnectSource::Client),
                _ => (ConnectionState::Disconnected, DisconnectSource::Client),
            };
            warn!(error = %err, "connect failed");
            self.state.transition(next)?;
            self.emit(Event::Disconnected {
                source,
                cause: Some(err.to_string()),
            });
        }
        result
    }

    async fn handshake(&mut self) -> Result<(Link, bool)> {
        let settings = &self.settings;
        let mut channel = transport::open(&settings.broker, &settings.transport).await?;
        let timeout = Duration::from_millis(settings.broker.connect_timeout_ms);
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        let codec = self.codec;
        let connect = Packet::Connect(self.connect.clone());
        let exchange = async {
            let bytes = codec.to_bytes(&connect)?;
            channel.write(&bytes).await?;
            read_packet(&mut channel, &mut buf, &codec).await
        };
        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(Packet::ConnAck(connack))) if connack.code.is_error() => {
                Err(Error::ConnectionRefused(connack.code))
            }
            Ok(Ok(Packet::ConnAck(connack))) => Ok(connack.session_present),
            Ok(Ok(other)) => Err(Error::ProtocolViolation(format!(
                "expected CONNACK, received {:?}",
                other.packet_type()
            ))),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::ConnAckTimeout(timeout)),
        };

        match outcome {
            Ok(session_present) => {
                info!(
                    client_id = %self.connect.client_id,
                    session_present,
                    "connected to broker"
                );
                let keepalive = KeepAlive::new(self.connect.keep_alive, Instant::now());
                Ok((
                    Link {
                        channel,
                        buf,
                        keepalive,
                    },
                    session_present,
                ))
            }
            Err(err) => {
                channel.close().await;
                Err(err)
            }
        }
    }

    async fn serve(&mut self, mut link: Link, session_present: bool) -> End {
        if let Err(err) = self.state.transition(ConnectionState::Connected) {
            return self.lose(&mut link, err).await;
        }
        self.emit(Event::Connected { session_present });

        let resume = self
            .session
            .on_connected(self.connect.clean_session, session_present, now_ms());
        for packet in &resume {
            if let Err(err) = self.send(&mut link, packet).await {
                return self.lose(&mut link, err).await;
            }
        }

        let mut retry_tick = tokio::time::interval(self.retry_tick_period());
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // the CONNACK read may already have buffered more packets
            loop {
                match self.codec.decode(&mut link.buf) {
                    Ok(Some(packet)) => {
                        if let Err(err) = self.handle_incoming(&mut link, packet).await {
                            return self.lose(&mut link, err).await;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => return self.lose(&mut link, err.into()).await,
                }
            }
            link.buf.reserve(READ_BUFFER_SIZE);
            let deadline = link.keepalive.next_deadline();

            tokio::select! {
                read = link.channel.read(&mut link.buf) => match read {
                    Ok(0) => return self.lose(&mut link, Error::ConnectionClosed).await,
                    Ok(_) => {}
                    Err(err) => return self.lose(&mut link, err.into()).await,
                },
                request = self.requests.recv() => match request {
                    Some(Request::Disconnect { resp }) => {
                        self.disconnect(&mut link).await;
                        let _ = resp.send(Ok(()));
                        return End::Stopped;
                    }
                    Some(request) => {
                        if let Err(err) = self.handle_request(&mut link, request).await {
                            return self.lose(&mut link, err).await;
                        }
                    }
                    None => {
                        debug!("all client handles dropped, disconnecting");
                        self.disconnect(&mut link).await;
                        return End::Stopped;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    match link.keepalive.poll(Instant::now()) {
                        KeepAliveAction::SendPing => {
                            if let Err(err) = self.send(&mut link, &Packet::PingReq).await {
                                return self.lose(&mut link, err).await;
                            }
                            link.keepalive.on_ping_sent(Instant::now());
                        }
                        KeepAliveAction::TimedOut => {
                            let interval = link.keepalive.interval().unwrap_or_default();
                            return self.lose(&mut link, Error::KeepAliveTimeout(interval)).await;
                        }
                        KeepAliveAction::Idle => {}
                    }
                },
                _ = retry_tick.tick() => {
                    if let Err(err) = self.expire(&mut link).await {
                        return self.lose(&mut link, err).await;
                    }
                },
            }
        }
    }

    async fn handle_incoming(&mut self, link: &mut Link, packet: Packet) -> Result<()> {
        match packet {
            Packet::Publish(publish) => {
                let action = self.session.handle_incoming_publish(&publish);
                if action.deliver {
                    self.emit(Event::Message(publish));
                } else {
                    debug!(packet_id = ?publish.packet_id, "duplicate QoS 2 publish not delivered");
                }
                if let Some(reply) = action.reply {
                    self.send(link, &reply).await?;
                }
            }
            Packet::PubAck(ack) => {
                self.session.handle_puback(ack.packet_id)?;
            }
            Packet::PubRec(rec) => {
                let pubrel = self.session.handle_pubrec(rec.packet_id, now_ms())?;
                self.send(link, &pubrel).await?;
            }
            Packet::PubRel(rel) => {
                let pubcomp = self.session.handle_incoming_pubrel(rel.packet_id);
                self.send(link, &pubcomp).await?;
            }
            Packet::PubComp(comp) => {
                self.session.handle_pubcomp(comp.packet_id)?;
            }
            Packet::SubAck(suback) => {
                self.session.handle_suback(suback)?;
            }
            Packet::UnsubAck(unsuback) => {
                self.session.handle_unsuback(unsuback.packet_id)?;
            }
            Packet::PingResp => link.keepalive.on_pingresp(),
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "broker sent {:?}",
                    other.packet_type()
                )));
            }
        }
        Ok(())
    }

    async fn handle_request(&mut self, link: &mut Link, request: Request) -> Result<()> {
        let now = now_ms();
        match request {
            Request::Publish {
                topic,
                payload,
                qos,
                retain,
                resp,
            } => {
                let publish = match self.session.start_publish(topic, payload, qos, retain, now) {
                    Ok(publish) => publish,
                    Err(err) => {
                        let _ = resp.send(Err(err));
                        return Ok(());
                    }
                };
                let packet_id = publish.packet_id;
                let bytes = match self.codec.to_bytes(&Packet::Publish(publish)) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        if let Some(id) = packet_id {
                            self.session.abort(id);
                        }
                        let _ = resp.send(Err(err.into()));
                        return Ok(());
                    }
                };
                match packet_id {
                    Some(id) => {
                        self.session.attach_publish_responder(id, resp);
                        self.write(link, &bytes).await
                    }
                    None => match self.write(link, &bytes).await {
                        Ok(()) => {
                            let _ = resp.send(Ok(()));
                            Ok(())
                        }
                        Err(err) => {
                            let _ = resp.send(Err(Error::NotConnected));
                            Err(err)
                        }
                    },
                }
            }
            Request::Subscribe { filters, resp } => {
                let subscribe = match self.session.start_subscribe(filters, now) {
                    Ok(subscribe) => subscribe,
                    Err(err) => {
                        let _ = resp.send(Err(err));
                        return Ok(());
                    }
                };
                let packet_id = subscribe.packet_id;
                match self.codec.to_bytes(&Packet::Subscribe(subscribe)) {
                    Ok(bytes) => {
                        self.session.attach_subscribe_responder(packet_id, resp);
                        self.write(link, &bytes).await
                    }
                    Err(err) => {
                        self.session.abort(packet_id);
                        let _ = resp.send(Err(err.into()));
                        Ok(())
                    }
                }
            }
            Request::Unsubscribe { filters, resp } => {
                let unsubscribe = match self.session.start_unsubscribe(filters, now) {
                    Ok(unsubscribe) => unsubscribe,
                    Err(err) => {
                        let _ = resp.send(Err(err));
                        return Ok(());
                    }
                };
                let packet_id = unsubscribe.packet_id;
                match self.codec.to_bytes(&Packet::Unsubscribe(unsubscribe)) {
                    Ok(bytes) => {
                        self.session.attach_unsubscribe_responder(packet_id, resp);
                        self.write(link, &bytes).await
                    }
                    Err(err) => {
                        self.session.abort(packet_id);
                        let _ = resp.send(Err(err.into()));
                        Ok(())
                    }
                }
            }
            // handled by the caller
            Request::Disconnect { resp } => {
                let _ = resp.send(Ok(()));
                Ok(())
            }
        }
    }

    async fn expire(&mut self, link: &mut Link) -> Result<()> {
        let expiry = self.session.expire(now_ms());
        for packet_id in expiry.failed_publishes {
            self.emit(Event::PublishFailed { packet_id });
        }
        for packet in &expiry.resend {
            self.send(link, packet).await?;
        }
        Ok(())
    }

    async fn disconnect(&mut self, link: &mut Link) {
        if let Err(err) = self.state.transition(ConnectionState::Disconnecting) {
            warn!(error = %err, "disconnect in unexpected state");
        }
        if let Err(err) = self.send(link, &Packet::Disconnect).await {
            debug!(error = %err, "failed to send DISCONNECT");
        }
        link.channel.close().await;
        self.session.on_connection_lost();
        if let Err(err) = self.state.transition(ConnectionState::Disconnected) {
            warn!(error = %err, "disconnect in unexpected state");
        }
        info!("disconnected from broker");
        self.emit(Event::Disconnected {
            source: DisconnectSource::User,
            cause: None,
        });
    }

    /// Tear down a connection that ended without the application asking.
    async fn lose(&mut self, link: &mut Link, err: Error) -> End {
        link.channel.close().await;
        self.session.on_connection_lost();

        let source = match err {
            Error::ConnectionClosed => DisconnectSource::Server,
            _ => DisconnectSource::Client,
        };
        let next = if err.is_fatal() {
            error!(error = %err, "connection failed");
            ConnectionState::Failed
        } else {
            warn!(error = %err, "connection lost");
            ConnectionState::Disconnected
        };
        if let Err(transition) = self.state.transition(next) {
            warn!(error = %transition, "unexpected state while closing connection");
        }
        self.emit(Event::Disconnected {
            source,
            cause: Some(err.to_string()),
        });
        End::Lost(err)
    }

    /// Sleep out the reconnect delay. Returns `false` if the client asked to
    /// stop in the meantime.
    async fn wait_before_reconnect(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                request = self.requests.recv() => match request {
                    Some(Request::Disconnect { resp }) => {
                        let _ = resp.send(Ok(()));
                        self.emit(Event::Disconnected {
                            source: DisconnectSource::User,
                            cause: None,
                        });
                        return false;
                    }
                    Some(request) => request.reject(Error::NotConnected),
                    None => return false,
                },
            }
        }
    }

    async fn send(&mut self, link: &mut Link, packet: &Packet) -> Result<()> {
        let bytes = self.codec.to_bytes(packet)?;
        self.write(link, &bytes).await
    }

    async fn write(&mut self, link: &mut Link, bytes: &[u8]) -> Result<()> {
        link.channel.write(bytes).await?;
        link.keepalive.on_packet_sent(Instant::now());
        Ok(())
    }

    fn emit(&self, event: Event) {
        // the application may have dropped its event receiver
        let _ = self.events.send(event);
    }

    fn retry_tick_period(&self) -> Duration {
        let interval = Duration::from_millis(self.settings.session.retry_interval_ms);
        (interval / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }
}

/// Read until one complete packet is decoded from `buf`.
async fn read_packet(channel: &mut Channel, buf: &mut BytesMut, codec: &MqttCodec) -> Result<Packet> {
    loop {
        if let Some(packet) = codec.decode(buf)? {
            return Ok(packet);
        }
        buf.reserve(READ_BUFFER_SIZE);
        if channel.read(buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
