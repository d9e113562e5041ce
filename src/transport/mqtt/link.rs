//! MQTT implementation of [`WorkerLink`]
//!
//! A supervisor task owns the rumqttc event loop. It subscribes to every
//! worker's events topic on each ConnAck, forwards parsed events to the
//! scheduler's inbound channel and rebuilds the connection with backoff when
//! the broker goes away. Publishing goes through a shared client handle that
//! the supervisor swaps on reconnect.

use super::connection::{
    configure_mqtt_options, ConnectionState, CoordinatorStatus, CoordinatorStatusType, MqttError,
    ReconnectConfig, ReconnectionDecision,
};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::observability::MetricsCollector;
use crate::protocol::{CoordinatorMessage, TaskAssignment, WorkerTopics};
use crate::transport::{InboundEvent, LinkError, WorkerLink};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CLIENT_CHANNEL_CAPACITY: usize = 64;
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct MqttWorkerLink {
    federation_id: String,
    topics: WorkerTopics,
    client: Arc<Mutex<AsyncClient>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsCollector>,
}

impl MqttWorkerLink {
    /// Start the supervisor and wait for the broker to acknowledge the connection
    pub async fn connect(
        federation_id: &str,
        config: &MqttSection,
        credentials: Option<(String, String)>,
        inbound_tx: mpsc::Sender<InboundEvent>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, MqttError> {
        let link = Self::start(federation_id, config, credentials, inbound_tx, metrics)?;
        Self::wait_for_connection_confirmation(link.state_rx.clone(), CONNACK_TIMEOUT).await?;
        info!(
            federation_id = %federation_id,
            broker = %config.broker_url,
            "Connected to MQTT broker"
        );
        Ok(link)
    }

    /// Start the supervisor without waiting for ConnAck
    pub fn start(
        federation_id: &str,
        config: &MqttSection,
        credentials: Option<(String, String)>,
        inbound_tx: mpsc::Sender<InboundEvent>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, MqttError> {
        let (client, event_loop) =
            Self::create_connection(federation_id, config, credentials.as_ref())?;
        let client = Arc::new(Mutex::new(client));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics.mqtt_connection_attempt();

        let supervisor = Supervisor {
            federation_id: federation_id.to_string(),
            config: config.clone(),
            credentials,
            topics: WorkerTopics::new(&config.topic_prefix),
            client: client.clone(),
            state_tx,
            inbound_tx,
            metrics: metrics.clone(),
            reconnect: ReconnectConfig::default(),
            attempts: 0,
        };
        let handle = tokio::spawn(supervisor.run(event_loop, shutdown_rx));

        Ok(Self {
            federation_id: federation_id.to_string(),
            topics: WorkerTopics::new(&config.topic_prefix),
            client,
            state_rx,
            shutdown_tx,
            handle: std::sync::Mutex::new(Some(handle)),
            metrics,
        })
    }

    fn create_connection(
        federation_id: &str,
        config: &MqttSection,
        credentials: Option<&(String, String)>,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let options = configure_mqtt_options(federation_id, config, credentials)?;
        Ok(AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY))
    }

    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let wait = async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(MqttError::ConnectionFailed(
                            format!("Permanently disconnected: {reason}").into(),
                        ));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailed(
                        "Connection supervisor stopped".into(),
                    ));
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            MqttError::ConnectionFailed("ConnAck timeout - broker did not confirm connection".into())
        })?
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    async fn publish(&self, worker_id: &str, message: &CoordinatorMessage) -> Result<(), MqttError> {
        let state = self.connection_state();
        if !state.can_publish() {
            return Err(MqttError::NotConnected { state });
        }

        let topic = self.topics.assignments(worker_id);
        let payload = serde_json::to_string(message).map_err(MqttError::SerializationError)?;

        let client = self.client.lock().await;
        match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            Ok(()) => {
                self.metrics.mqtt_message_published();
                debug!(topic = %topic, "Published coordinator message");
                Ok(())
            }
            Err(e) => {
                self.metrics.mqtt_publish_failed();
                Err(MqttError::PublishFailed(Box::new(e)))
            }
        }
    }

    /// Publish offline status, stop the supervisor and close the connection
    pub async fn disconnect(&self) {
        if self.connection_state().can_publish() {
            let status = CoordinatorStatus::new(&self.federation_id, CoordinatorStatusType::Offline);
            if let Ok(payload) = serde_json::to_string(&status) {
                let client = self.client.lock().await;
                if let Err(e) = client
                    .publish(self.topics.coordinator_status(), QoS::AtLeastOnce, true, payload)
                    .await
                {
                    warn!(error = %e, "Failed to publish offline status");
                }
            }
        }

        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.client.lock().await.disconnect().await {
            debug!(error = %e, "MQTT disconnect request not delivered");
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => info!("MQTT supervisor shut down gracefully"),
                Ok(Err(e)) => warn!(error = %e, "MQTT supervisor ended with error"),
                Err(_) => warn!("MQTT supervisor did not stop in time"),
            }
        }
    }
}

#[async_trait]
impl WorkerLink for MqttWorkerLink {
    async fn send_assignment(
        &self,
        worker_id: &str,
        assignment: &TaskAssignment,
    ) -> Result<(), LinkError> {
        let message = CoordinatorMessage::TaskAssignment(assignment.clone());
        Ok(self.publish(worker_id, &message).await?)
    }

    async fn send_cancel(
        &self,
        worker_id: &str,
        task_id: Uuid,
        reason: &str,
    ) -> Result<(), LinkError> {
        let message = CoordinatorMessage::TaskCancelled {
            task_id,
            reason: reason.to_string(),
        };
        Ok(self.publish(worker_id, &message).await?)
    }
}

/// State owned by the background connection task
struct Supervisor {
    federation_id: String,
    config: MqttSection,
    credentials: Option<(String, String)>,
    topics: WorkerTopics,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    metrics: Arc<MetricsCollector>,
    reconnect: ReconnectConfig,
    attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        info!(federation_id = %self.federation_id, "Starting MQTT connection supervisor");

        loop {
            let keep_going = tokio::select! {
                _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
                event = event_loop.poll() => match event {
                    Ok(event) => {
                        match MessageHandler::route_mqtt_event(&event) {
                            EventRoute::ConnectionAcknowledged => {
                                self.on_connected().await;
                                true
                            }
                            EventRoute::MessageReceived { topic, payload, retain } => {
                                self.on_message(&topic, &payload, retain).await
                            }
                            EventRoute::Disconnected => {
                                self.on_connection_lost("Broker disconnected".to_string());
                                self.reconnect(&mut event_loop, &shutdown_rx).await
                            }
                            EventRoute::SubscriptionConfirmed { packet_id } => {
                                debug!(packet_id, "Subscription confirmed");
                                true
                            }
                            EventRoute::InfrastructureEvent(event) => {
                                debug!("MQTT event: {}", event);
                                true
                            }
                            EventRoute::OutgoingEvent => true,
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "MQTT event loop error");
                        self.on_connection_lost(e.to_string());
                        self.reconnect(&mut event_loop, &shutdown_rx).await
                    }
                },
            };

            if !keep_going {
                break;
            }
        }

        let _ = self
            .state_tx
            .send(ConnectionState::Disconnected("Supervisor stopped".to_string()));
        info!("MQTT connection supervisor stopped");
    }

    async fn on_connected(&mut self) {
        self.attempts = 0;
        let _ = self.state_tx.send(ConnectionState::Connected);
        self.metrics.mqtt_connection_established();

        let client = self.client.lock().await;
        let subscription = self.topics.events_subscription();
        match client.subscribe(&subscription, QoS::AtLeastOnce).await {
            Ok(()) => info!(topic = %subscription, "Subscribed to worker events"),
            Err(e) => error!(topic = %subscription, error = %e, "Failed to subscribe"),
        }

        let online = CoordinatorStatus::new(&self.federation_id, CoordinatorStatusType::Online);
        if let Ok(payload) = serde_json::to_string(&online) {
            if let Err(e) = client
                .publish(self.topics.coordinator_status(), QoS::AtLeastOnce, true, payload)
                .await
            {
                warn!(error = %e, "Failed to publish online status");
            }
        }
    }

    /// Returns false once the scheduler has dropped its inbound receiver
    async fn on_message(&self, topic: &str, payload: &[u8], retain: bool) -> bool {
        if !MessageHandler::should_process(topic, retain) {
            return true;
        }

        match MessageHandler::parse_worker_event(&self.topics, topic, payload) {
            Ok(event) => {
                self.metrics.mqtt_message_received();
                if self.inbound_tx.send(event).await.is_err() {
                    info!("Scheduler inbound channel closed, stopping MQTT supervisor");
                    return false;
                }
            }
            Err(e) => {
                self.metrics.mqtt_message_rejected();
                warn!(topic = %topic, error = %e, "Rejected worker message");
            }
        }
        true
    }

    fn on_connection_lost(&self, reason: String) {
        if self.state_tx.borrow().can_publish() {
            self.metrics.mqtt_connection_lost();
        }
        let _ = self.state_tx.send(ConnectionState::Disconnected(reason));
    }

    /// Returns false when the supervisor should stop
    async fn reconnect(
        &mut self,
        event_loop: &mut EventLoop,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        let stop_requested = *shutdown_rx.borrow();
        match self.reconnect.decide(self.attempts, stop_requested) {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.attempts = attempt;
                let _ = self.state_tx.send(ConnectionState::Reconnecting(attempt));
                info!(attempt, delay_ms, "Attempting MQTT reconnection");

                if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                match MqttWorkerLink::create_connection(
                    &self.federation_id,
                    &self.config,
                    self.credentials.as_ref(),
                ) {
                    Ok((client, new_event_loop)) => {
                        *event_loop = new_event_loop;
                        *self.client.lock().await = client;
                        self.metrics.mqtt_connection_attempt();
                    }
                    Err(e) => error!(error = %e, "Failed to create new MQTT connection"),
                }
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown requested, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts } => {
                let reason = format!("Max reconnection attempts ({max_attempts}) exceeded");
                error!("{}", reason);
                let _ = self
                    .state_tx
                    .send(ConnectionState::PermanentlyDisconnected(reason));
                false
            }
        }
    }
}

/// Sleep unless shutdown is signalled first. Returns false on shutdown.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}
