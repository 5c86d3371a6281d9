use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;
use uuid::Uuid;

use crate::codec::{QoS, SubscribeFilter, SubscribeReturnCode};
use crate::config::Settings;
use crate::connection::eventloop::{ConnectionTask, Request};
use crate::connection::{ConnectionState, Event, ReconnectPolicy, StateMachine, reconnect};
use crate::session::{FlowStore, Session};
use crate::utils::error::{Error, Result};

/// Prefix of generated client identifiers.
pub const CLIENT_ID_PREFIX: &str = "mqttlink-";

const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Lifecycle events and incoming messages of one client.
pub type Events = mpsc::UnboundedReceiver<Event>;

/// Handle to a running MQTT connection.
///
/// Cloning is cheap; all clones drive the same connection. The connection
/// task disconnects once every handle is dropped.
#[derive(Debug, Clone)]
pub struct MqttClient {
    client_id: String,
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
}

/// Configures a client before connecting it.
pub struct ClientBuilder {
    settings: Settings,
    policy: Option<Box<dyn ReconnectPolicy>>,
}

impl ClientBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            policy: None,
        }
    }

    /// Replace the policy derived from the `reconnect` settings.
    pub fn reconnect_policy(mut self, policy: impl ReconnectPolicy) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Start the connection task and wait for the first CONNACK.
    pub async fn connect(self) -> Result<(MqttClient, Events)> {
        let settings = self.settings;
        settings.validate()?;

        let client_id = if settings.broker.client_id.is_empty() {
            generate_client_id()
        } else {
            settings.broker.client_id.clone()
        };
        let session = match &settings.session.persistence_path {
            Some(path) => Session::with_store(&settings.session, FlowStore::open(path)?)?,
            None => Session::new(&settings.session),
        };
        let policy = self
            .policy
            .unwrap_or_else(|| reconnect::from_settings(&settings.reconnect));

        let (state, state_rx) = StateMachine::new();
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask::new(
            settings,
            client_id.clone(),
            session,
            state,
            request_rx,
            event_tx,
            policy,
        )?;

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(task.run(ready_tx));
        let session_present = ready_rx.await.map_err(|_| Error::NotConnected)??;
        info!(%client_id, session_present, "client connected");

        Ok((
            MqttClient {
                client_id,
                requests: request_tx,
                state: state_rx,
            },
            event_rx,
        ))
    }
}

impl MqttClient {
    /// Connect with the given settings and the reconnect policy they describe.
    pub async fn connect(settings: Settings) -> Result<(Self, Events)> {
        ClientBuilder::new(settings).connect().await
    }

    pub fn builder(settings: Settings) -> ClientBuilder {
        ClientBuilder::new(settings)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Publish a message. Resolves once the message is written (QoS 0),
    /// acknowledged with PUBACK (QoS 1) or completed with PUBCOMP (QoS 2).
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        let topic = topic.into();
        let payload = payload.into();
        self.request(|resp| Request::Publish {
            topic,
            payload,
            qos,
            retain,
            resp,
        })
        .await
    }

    /// Subscribe to one filter, returning the QoS the broker granted.
    pub async fn subscribe(&self, filter: impl Into<String>, qos: QoS) -> Result<QoS> {
        let filter = filter.into();
        let codes = self
            .subscribe_many(vec![SubscribeFilter::new(filter.clone(), qos)])
            .await?;
        match codes.first() {
            Some(SubscribeReturnCode::Success(granted)) => Ok(*granted),
            _ => Err(Error::SubscriptionRejected(filter)),
        }
    }

    /// Subscribe to several filters in one SUBSCRIBE; one return code per filter.
    pub async fn subscribe_many(&self, filters: Vec<SubscribeFilter>) -> Result<Vec<SubscribeReturnCode>> {
        self.request(|resp| Request::Subscribe { filters, resp }).await
    }

    pub async fn unsubscribe(&self, filter: impl Into<String>) -> Result<()> {
        let filters = vec![filter.into()];
        self.request(|resp| Request::Unsubscribe { filters, resp }).await
    }

    /// Send DISCONNECT and close the connection. The connection task ends,
    /// so every clone of this handle stops working.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|resp| Request::Disconnect { resp }).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::NotConnected)?
    }
}

/// A random 23 character client identifier, the longest every broker must accept.
pub fn generate_client_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{CLIENT_ID_PREFIX}{}", &suffix[..23 - CLIENT_ID_PREFIX.len()])
}
