//! The MQTT transport handler: protocol state machine multiplexing telemetry,
//! direct methods and device twin traffic over a single channel.
//!
//! The handler owns subscribe/unsubscribe lifecycle per topic family,
//! correlates outstanding twin GET/PATCH requests by request id, dispatches
//! inbound publishes to the right consumer, and exposes cancellation-aware
//! operations with timeouts. Faults detected on the read path are broadcast
//! through a transport-closed signal so no receive-style waiter ever hangs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use mqtt::packet::*;
use mqtt::{QualityOfService, TopicFilter, TopicName};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelFactory, ConnectAuth};
use crate::message::{DirectMethodInvocation, DirectMethodResponse, Message, MessageType};
use crate::settings::{TokenSource, TransportSettings};
use crate::topic::{self, InboundTopic, TopicMatcher};
use crate::IoTHubError;

const INPUT_NAME_PROPERTY: &str = "iothub-inputname";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Opening,
    Open,
    Closing,
    Closed,
}

/// The subscription topic families the handler manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicFamily {
    Methods,
    TwinResponse,
    TwinPatch,
    DeviceBound,
    InputEvents,
}

/// One flag per topic family. Enabling is idempotent and disabling when not
/// enabled is a no-op, so each transition writes at most one frame.
#[derive(Debug, Default, Clone, Copy)]
struct SubscriptionState {
    methods: bool,
    twin_response: bool,
    twin_patch: bool,
    device_bound: bool,
    input_events: bool,
}

impl SubscriptionState {
    fn get(&self, family: TopicFamily) -> bool {
        match family {
            TopicFamily::Methods => self.methods,
            TopicFamily::TwinResponse => self.twin_response,
            TopicFamily::TwinPatch => self.twin_patch,
            TopicFamily::DeviceBound => self.device_bound,
            TopicFamily::InputEvents => self.input_events,
        }
    }

    fn set(&mut self, family: TopicFamily, enabled: bool) {
        match family {
            TopicFamily::Methods => self.methods = enabled,
            TopicFamily::TwinResponse => self.twin_response = enabled,
            TopicFamily::TwinPatch => self.twin_patch = enabled,
            TopicFamily::DeviceBound => self.device_bound = enabled,
            TopicFamily::InputEvents => self.input_events = enabled,
        }
    }
}

/// Response to a twin GET or reported-property PATCH, correlated by request id.
#[derive(Debug)]
pub struct TwinResponse {
    /// HTTP-style status carried on the response topic
    pub status: i32,
    /// The correlation token of the originating request
    pub request_id: String,
    /// Twin document version, when the service reports one
    pub version: Option<String>,
    /// Response payload; a twin document for GET, usually empty for PATCH
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
struct Shared {
    state: State,
    fault: Option<String>,
    subscriptions: SubscriptionState,
    pending_twin: HashMap<String, oneshot::Sender<TwinResponse>>,
    pending_acks: HashMap<u16, oneshot::Sender<()>>,
}

impl Default for State {
    fn default() -> Self {
        State::Created
    }
}

// State shared between caller operations and the channel read loop. All
// mutation happens under `shared`; a twin response racing a timeout removal
// of the same pending entry is serialized there.
#[derive(Debug)]
struct Core {
    settings: TransportSettings,
    matcher: TopicMatcher,
    shared: Mutex<Shared>,
    // per-connection signal, replaced on every open
    closed: Mutex<CancellationToken>,
    events_tx: mpsc::UnboundedSender<MessageType>,
    next_packet_id: AtomicU16,
    next_request_id: AtomicU64,
}

/// MQTT transport handler for a single device or module connection.
pub struct MqttTransportHandler {
    core: Arc<Core>,
    token_source: Box<dyn TokenSource + Send + Sync>,
    channel_factory: ChannelFactory,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MessageType>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttTransportHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransportHandler")
            .field("core", &self.core)
            .finish()
    }
}

impl MqttTransportHandler {
    /// Handler connecting over TLS to the hub named in `settings`.
    pub fn new<TS>(settings: TransportSettings, token_source: TS) -> Self
    where
        TS: TokenSource + Send + Sync + 'static,
    {
        Self::with_channel_factory(settings, token_source, crate::channel::tls_channel_factory())
    }

    /// Handler using a caller-supplied channel factory. This is the seam the
    /// tests use to run the state machine against a scripted channel.
    pub fn with_channel_factory<TS>(
        settings: TransportSettings,
        token_source: TS,
        channel_factory: ChannelFactory,
    ) -> Self
    where
        TS: TokenSource + Send + Sync + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let matcher = TopicMatcher::new(&settings);
        Self {
            core: Arc::new(Core {
                settings,
                matcher,
                shared: Mutex::new(Shared::default()),
                closed: Mutex::new(CancellationToken::new()),
                events_tx,
                next_packet_id: AtomicU16::new(1),
                next_request_id: AtomicU64::new(1),
            }),
            token_source: Box::new(token_source),
            channel_factory,
            channel: Mutex::new(None),
            events_rx: tokio::sync::Mutex::new(events_rx),
            read_task: Mutex::new(None),
        }
    }

    /// Establish the channel and start dispatching inbound traffic. Opening
    /// again after an orderly [`close`](Self::close) builds a fresh
    /// connection and restores every subscription family that was enabled;
    /// a faulted handler stays closed.
    ///
    /// A connect failure surfaces as [`IoTHubError::Communication`]: the raw
    /// channel error is logged and the post-condition "channel initialized"
    /// decides the outcome, so a channel that reports success without coming
    /// up still fails loudly.
    pub async fn open(&self, ct: &CancellationToken) -> crate::Result<()> {
        if ct.is_cancelled() {
            return Err(IoTHubError::Canceled);
        }
        {
            let mut shared = self.core.shared.lock().unwrap();
            if let Some(cause) = &shared.fault {
                return Err(IoTHubError::TransportClosed(cause.clone()));
            }
            match shared.state {
                State::Created | State::Closed => shared.state = State::Opening,
                State::Open => return Ok(()),
                State::Opening | State::Closing => {
                    return Err(IoTHubError::InvalidState(
                        "open requires a created or closed handler",
                    ))
                }
            }
        }
        // Waiters on the previous connection were already released when it
        // went away; this connection gets its own closed signal.
        *self.core.closed.lock().unwrap() = CancellationToken::new();

        let expiry = Utc::now() + Duration::days(1);
        trace!("Generating token that will expire at {}", expiry);
        let auth = ConnectAuth {
            client_id: self.core.settings.client_id(),
            user_name: self.core.settings.user_name(),
            password: self.token_source.get(&expiry),
        };

        let channel = (self.channel_factory)(&self.core.settings, auth);
        if let Err(err) = channel.open().await {
            trace!("Channel open reported {}", err);
        }
        if !channel.is_open() {
            self.core.shared.lock().unwrap().state = State::Closed;
            return Err(IoTHubError::Communication(
                "transport channel could not be initialized".to_string(),
            ));
        }

        *self.channel.lock().unwrap() = Some(Arc::clone(&channel));
        self.core.shared.lock().unwrap().state = State::Open;
        self.spawn_read_loop(Arc::clone(&channel));
        self.on_connected(ct).await?;

        info!(
            "Transport open for {} as {}",
            self.core.settings.hostname,
            self.core.settings.client_id()
        );
        Ok(())
    }

    // Connected hook: restore any subscription family that was enabled when
    // the channel last went away.
    async fn on_connected(&self, ct: &CancellationToken) -> crate::Result<()> {
        let subscriptions = self.core.shared.lock().unwrap().subscriptions;
        if subscriptions.methods {
            self.subscribe(topic::METHOD_POST_TOPIC_FILTER.to_string(), "enable_methods", ct)
                .await?;
        }
        if subscriptions.twin_response {
            self.subscribe(
                topic::TWIN_RESPONSE_TOPIC_FILTER.to_string(),
                "twin response subscription",
                ct,
            )
            .await?;
        }
        if subscriptions.twin_patch {
            self.subscribe(
                topic::TWIN_PATCH_TOPIC_FILTER.to_string(),
                "enable_twin_patch",
                ct,
            )
            .await?;
        }
        if subscriptions.device_bound {
            self.subscribe(
                topic::device_bound_messages_topic_filter(&self.core.settings.device_id),
                "enable_receive_message",
                ct,
            )
            .await?;
        }
        if subscriptions.input_events {
            if let Some(module_id) = &self.core.settings.module_id {
                self.subscribe(
                    topic::module_input_events_topic_filter(
                        &self.core.settings.device_id,
                        module_id,
                    ),
                    "enable_event_receive",
                    ct,
                )
                .await?;
            }
        }
        Ok(())
    }

    fn spawn_read_loop(&self, channel: Arc<dyn Channel>) {
        let core = Arc::clone(&self.core);
        let closed = self.core.closed_token();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    packet = channel.read_packet() => match packet {
                        Ok(packet) => core.on_packet(packet),
                        Err(err) => {
                            core.on_error(err);
                            break;
                        }
                    },
                }
            }
        });
        *self.read_task.lock().unwrap() = Some(handle);
    }

    /// Publish a device-to-cloud (or module-to-cloud) telemetry message.
    pub async fn send_message(
        &self,
        message: Message,
        ct: &CancellationToken,
    ) -> crate::Result<()> {
        self.check_ready(ct)?;

        let base = match &self.core.settings.module_id {
            Some(module_id) => topic::module_cloud_bound_messages_topic(
                &self.core.settings.device_id,
                module_id,
            ),
            None => topic::cloud_bound_messages_topic(&self.core.settings.device_id),
        };
        let base_topic =
            TopicName::new(base).map_err(|e| IoTHubError::Protocol(e.to_string()))?;
        let full_topic = topic::build_topic_name(&base_topic, &message)
            .map_err(|e| IoTHubError::Protocol(e.to_string()))?;

        trace!("Sending message {:?} to topic {:?}", message, full_topic);
        let packet = PublishPacket::new(full_topic, QoSWithPacketIdentifier::Level0, message.body);
        self.write(VariablePacket::PublishPacket(packet), ct).await
    }

    /// Start listening for direct method invocations.
    pub async fn enable_methods(&self, ct: &CancellationToken) -> crate::Result<()> {
        self.check_ready(ct)?;
        self.enable_family(
            TopicFamily::Methods,
            topic::METHOD_POST_TOPIC_FILTER.to_string(),
            "enable_methods",
            ct,
        )
        .await
    }

    /// Stop listening for direct method invocations.
    pub async fn disable_methods(&self, ct: &CancellationToken) -> crate::Result<()> {
        self.check_ready(ct)?;
        self.disable_family(
            TopicFamily::Methods,
            topic::METHOD_POST_TOPIC_FILTER.to_string(),
            "disable_methods",
            ct,
        )
        .await
    }

    /// Start receiving desired-property patches.
    pub async fn enable_twin_patch(&self, ct: &CancellationToken) -> crate::Result<()> {
        self.check_ready(ct)?;
        self.ensure_twin_response_subscription(ct).await?;
        self.enable_family(
            TopicFamily::TwinPatch,
            topic::TWIN_PATCH_TOPIC_FILTER.to_string(),
            "enable_twin_patch",
            ct,
        )
        .await
    }

    /// Stop receiving desired-property patches. The twin response
    /// subscription stays up since twin requests share it.
    pub async fn disable_twin_patch(&self, ct: &CancellationToken) -> crate::Result<()> {
        self.check_ready(ct)?;
        self.disable_family(
            TopicFamily::TwinPatch,
            topic::TWIN_PATCH_TOPIC_FILTER.to_string(),
            "disable_twin_patch",
            ct,
        )
        .await
    }

    /// Start receiving cloud-to-device messages.
    pub async fn enable_receive_message(&self, ct: &CancellationToken) -> crate::Result<()> {
        self.check_ready(ct)?;
        self.enable_family(
            TopicFamily::DeviceBound,
            topic::device_bound_messages_topic_filter(&self.core.settings.device_id),
            "enable_receive_message",
            ct,
        )
        .await
    }

    /// Stop receiving cloud-to-device messages.
    pub async fn disable_receive_message(&self, ct: &CancellationToken) -> crate::Result<()> {
        self.check_ready(ct)?;
        self.disable_family(
            TopicFamily::DeviceBound,
            topic::device_bound_messages_topic_filter(&self.core.settings.device_id),
            "disable_receive_message",
            ct,
        )
        .await
    }

    /// Start receiving module input events. Requires a module identity.
    pub async fn enable_event_receive(&self, ct: &CancellationToken) -> crate::Result<()> {
        self.check_ready(ct)?;
        let filter = self.module_events_filter()?;
        self.enable_family(TopicFamily::InputEvents, filter, "enable_event_receive", ct)
            .await
    }

    /// Stop receiving module input events.
    pub async fn disable_event_receive(&self, ct: &CancellationToken) -> crate::Result<()> {
        self.check_ready(ct)?;
        let filter = self.module_events_filter()?;
        self.disable_family(TopicFamily::InputEvents, filter, "disable_event_receive", ct)
            .await
    }

    fn module_events_filter(&self) -> crate::Result<String> {
        let module_id = self
            .core
            .settings
            .module_id
            .as_ref()
            .ok_or(IoTHubError::InvalidState("no module identity configured"))?;
        Ok(topic::module_input_events_topic_filter(
            &self.core.settings.device_id,
            module_id,
        ))
    }

    /// Request the full twin document.
    pub async fn send_twin_get(&self, ct: &CancellationToken) -> crate::Result<TwinResponse> {
        self.check_ready(ct)?;
        self.ensure_twin_response_subscription(ct).await?;

        let request_id = self.core.next_request_id();
        trace!("Requesting device twin properties with rid = {}", request_id);
        let topic_name = TopicName::new(topic::twin_get_topic(&request_id))
            .map_err(|e| IoTHubError::Protocol(e.to_string()))?;
        let packet = PublishPacket::new(topic_name, QoSWithPacketIdentifier::Level0, Vec::new());
        self.request_twin("twin get", request_id, VariablePacket::PublishPacket(packet), ct)
            .await
    }

    /// Publish a reported-property patch and await the service's response.
    /// The body is sent byte-for-byte; the caller owns its serialization.
    pub async fn send_twin_patch(
        &self,
        body: &str,
        ct: &CancellationToken,
    ) -> crate::Result<TwinResponse> {
        self.check_ready(ct)?;
        self.ensure_twin_response_subscription(ct).await?;

        let request_id = self.core.next_request_id();
        trace!("Publishing twin properties with rid = {}", request_id);
        let topic_name = TopicName::new(topic::twin_update_topic(&request_id))
            .map_err(|e| IoTHubError::Protocol(e.to_string()))?;
        let packet =
            PublishPacket::new(topic_name, QoSWithPacketIdentifier::Level0, body.as_bytes());
        self.request_twin(
            "twin patch",
            request_id,
            VariablePacket::PublishPacket(packet),
            ct,
        )
        .await
    }

    /// Answer a direct method invocation.
    pub async fn send_method_response(
        &self,
        response: DirectMethodResponse,
        ct: &CancellationToken,
    ) -> crate::Result<()> {
        self.check_ready(ct)?;
        trace!(
            "Responding to direct method with rid = {}",
            response.request_id
        );
        let topic_name = TopicName::new(topic::method_response_topic(
            response.status,
            &response.request_id,
        ))
        .map_err(|e| IoTHubError::Protocol(e.to_string()))?;
        let packet = PublishPacket::new(
            topic_name,
            QoSWithPacketIdentifier::Level0,
            response.body.into_bytes(),
        );
        self.write(VariablePacket::PublishPacket(packet), ct).await
    }

    /// Await the next dispatched inbound message, method invocation or twin
    /// patch. Completes with a transport fault instead of hanging when the
    /// connection goes away.
    pub async fn receive(&self, ct: &CancellationToken) -> crate::Result<MessageType> {
        if ct.is_cancelled() {
            return Err(IoTHubError::Canceled);
        }
        let closed = self.core.closed_token();
        let mut events = self.events_rx.lock().await;
        tokio::select! {
            _ = ct.cancelled() => Err(IoTHubError::Canceled),
            _ = closed.cancelled() => Err(self.core.closed_fault()),
            event = events.recv() => event.ok_or_else(|| self.core.closed_fault()),
        }
    }

    /// Send a keep-alive probe.
    pub async fn ping(&self, ct: &CancellationToken) -> crate::Result<()> {
        self.check_ready(ct)?;
        info!("Sending PINGREQ to broker");
        self.write(VariablePacket::PingreqPacket(PingreqPacket::new()), ct)
            .await
    }

    /// Resolves once the current connection has closed: `Ok` after an
    /// orderly close, the recorded fault otherwise. Reopening the handler
    /// arms a fresh signal for the new connection.
    pub async fn wait_for_transport_closed(&self) -> crate::Result<()> {
        self.core.closed_token().cancelled().await;
        match &self.core.shared.lock().unwrap().fault {
            Some(cause) => Err(IoTHubError::TransportClosed(cause.clone())),
            None => Ok(()),
        }
    }

    /// Close the channel and release every pending waiter. Idempotent.
    pub async fn close(&self) -> crate::Result<()> {
        {
            let mut shared = self.core.shared.lock().unwrap();
            match shared.state {
                State::Closing | State::Closed => {}
                _ => shared.state = State::Closing,
            }
        }

        if let Some(handle) = self.read_task.lock().unwrap().take() {
            handle.abort();
        }
        let channel = self.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            // Best effort; the broker drops us either way
            let _ = channel
                .write_and_flush(VariablePacket::DisconnectPacket(DisconnectPacket::new()))
                .await;
            let _ = channel.close().await;
        }

        self.core.release_waiters(None);
        self.core.shared.lock().unwrap().state = State::Closed;
        info!("Transport closed for {}", self.core.settings.client_id());
        Ok(())
    }

    // Every operation rejects a pre-canceled token before touching the wire
    // and requires the handler to be open and unfaulted.
    fn check_ready(&self, ct: &CancellationToken) -> crate::Result<()> {
        if ct.is_cancelled() {
            return Err(IoTHubError::Canceled);
        }
        let shared = self.core.shared.lock().unwrap();
        if let Some(cause) = &shared.fault {
            return Err(IoTHubError::TransportClosed(cause.clone()));
        }
        if shared.state != State::Open {
            return Err(IoTHubError::InvalidState("transport is not open"));
        }
        Ok(())
    }

    fn channel(&self) -> crate::Result<Arc<dyn Channel>> {
        self.channel
            .lock()
            .unwrap()
            .clone()
            .ok_or(IoTHubError::InvalidState("transport is not open"))
    }

    async fn write(&self, packet: VariablePacket, ct: &CancellationToken) -> crate::Result<()> {
        let channel = self.channel()?;
        tokio::select! {
            biased;
            _ = ct.cancelled() => Err(IoTHubError::Canceled),
            result = channel.write_and_flush(packet) => result,
        }
    }

    // The flag flips before the frame goes out and rolls back on failure, so
    // concurrent enables of the same family still write at most one frame.
    async fn enable_family(
        &self,
        family: TopicFamily,
        filter: String,
        operation: &'static str,
        ct: &CancellationToken,
    ) -> crate::Result<()> {
        {
            let mut shared = self.core.shared.lock().unwrap();
            if shared.subscriptions.get(family) {
                return Ok(());
            }
            shared.subscriptions.set(family, true);
        }
        match self.subscribe(filter, operation, ct).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.core
                    .shared
                    .lock()
                    .unwrap()
                    .subscriptions
                    .set(family, false);
                Err(err)
            }
        }
    }

    async fn disable_family(
        &self,
        family: TopicFamily,
        filter: String,
        operation: &'static str,
        ct: &CancellationToken,
    ) -> crate::Result<()> {
        {
            let mut shared = self.core.shared.lock().unwrap();
            if !shared.subscriptions.get(family) {
                return Ok(());
            }
            shared.subscriptions.set(family, false);
        }
        match self.unsubscribe(filter, operation, ct).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.core
                    .shared
                    .lock()
                    .unwrap()
                    .subscriptions
                    .set(family, true);
                Err(err)
            }
        }
    }

    // Twin responses arrive on a topic family of their own; both the patch
    // receipt and the request/response operations need it exactly once.
    async fn ensure_twin_response_subscription(
        &self,
        ct: &CancellationToken,
    ) -> crate::Result<()> {
        self.enable_family(
            TopicFamily::TwinResponse,
            topic::TWIN_RESPONSE_TOPIC_FILTER.to_string(),
            "twin response subscription",
            ct,
        )
        .await
    }

    async fn subscribe(
        &self,
        filter: String,
        operation: &'static str,
        ct: &CancellationToken,
    ) -> crate::Result<()> {
        let filter = TopicFilter::new(filter).map_err(|e| IoTHubError::Protocol(e.to_string()))?;
        let packet_id = self.core.next_packet_id();
        trace!("Subscribing to {:?} with packet id {}", filter, packet_id);
        let packet = SubscribePacket::new(packet_id, vec![(filter, QualityOfService::Level0)]);
        self.write_and_await_ack(
            VariablePacket::SubscribePacket(packet),
            packet_id,
            operation,
            ct,
        )
        .await
    }

    async fn unsubscribe(
        &self,
        filter: String,
        operation: &'static str,
        ct: &CancellationToken,
    ) -> crate::Result<()> {
        let filter = TopicFilter::new(filter).map_err(|e| IoTHubError::Protocol(e.to_string()))?;
        let packet_id = self.core.next_packet_id();
        trace!("Unsubscribing from {:?} with packet id {}", filter, packet_id);
        let packet = UnsubscribePacket::new(packet_id, vec![filter]);
        self.write_and_await_ack(
            VariablePacket::UnsubscribePacket(packet),
            packet_id,
            operation,
            ct,
        )
        .await
    }

    async fn write_and_await_ack(
        &self,
        packet: VariablePacket,
        packet_id: u16,
        operation: &'static str,
        ct: &CancellationToken,
    ) -> crate::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.core
            .shared
            .lock()
            .unwrap()
            .pending_acks
            .insert(packet_id, tx);

        if let Err(err) = self.write(packet, ct).await {
            self.core.shared.lock().unwrap().pending_acks.remove(&packet_id);
            return Err(err);
        }

        let closed = self.core.closed_token();
        let result = tokio::select! {
            _ = ct.cancelled() => Err(IoTHubError::Canceled),
            _ = closed.cancelled() => Err(self.core.closed_fault()),
            acked = tokio::time::timeout(self.core.settings.ack_timeout, rx) => match acked {
                Err(_) => Err(IoTHubError::Timeout { operation }),
                Ok(Err(_)) => Err(self.core.closed_fault()),
                Ok(Ok(())) => Ok(()),
            },
        };
        if result.is_err() {
            self.core.shared.lock().unwrap().pending_acks.remove(&packet_id);
        }
        result
    }

    async fn request_twin(
        &self,
        operation: &'static str,
        request_id: String,
        packet: VariablePacket,
        ct: &CancellationToken,
    ) -> crate::Result<TwinResponse> {
        let (tx, rx) = oneshot::channel();
        self.core
            .shared
            .lock()
            .unwrap()
            .pending_twin
            .insert(request_id.clone(), tx);

        if let Err(err) = self.write(packet, ct).await {
            self.core.shared.lock().unwrap().pending_twin.remove(&request_id);
            return Err(err);
        }

        let closed = self.core.closed_token();
        let result = tokio::select! {
            _ = ct.cancelled() => Err(IoTHubError::Canceled),
            _ = closed.cancelled() => Err(self.core.closed_fault()),
            response = tokio::time::timeout(self.core.settings.twin_timeout, rx) => match response {
                Err(_) => Err(IoTHubError::Timeout { operation }),
                Ok(Err(_)) => Err(self.core.closed_fault()),
                Ok(Ok(response)) => {
                    if (200..300).contains(&response.status) {
                        Ok(response)
                    } else {
                        Err(IoTHubError::ServiceRejected { status: response.status })
                    }
                }
            },
        };
        if result.is_err() {
            self.core.shared.lock().unwrap().pending_twin.remove(&request_id);
        }
        result
    }

    #[cfg(test)]
    fn pending_twin_len(&self) -> usize {
        self.core.shared.lock().unwrap().pending_twin.len()
    }
}

impl Drop for MqttTransportHandler {
    fn drop(&mut self) {
        if let Some(handle) = self.read_task.lock().unwrap().take() {
            handle.abort();
        }
        self.core.closed_token().cancel();
    }
}

impl Core {
    fn closed_token(&self) -> CancellationToken {
        self.closed.lock().unwrap().clone()
    }

    fn next_packet_id(&self) -> u16 {
        let mut id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            // zero is not a valid packet identifier
            id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        }
        id
    }

    fn next_request_id(&self) -> String {
        self.next_request_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }

    fn closed_fault(&self) -> IoTHubError {
        let shared = self.shared.lock().unwrap();
        IoTHubError::TransportClosed(
            shared
                .fault
                .clone()
                .unwrap_or_else(|| "transport was closed".to_string()),
        )
    }

    // Invoked from the read loop on an unrecoverable channel error. Safe to
    // call repeatedly; the first cause wins and the signal fires once.
    fn on_error(&self, err: IoTHubError) {
        error!("Transport fault: {}", err);
        self.release_waiters(Some(err.to_string()));
    }

    fn release_waiters(&self, fault: Option<String>) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.fault.is_none() {
                shared.fault = fault;
            }
            // dropping the senders wakes any waiter not watching the token yet
            shared.pending_twin.clear();
            shared.pending_acks.clear();
        }
        self.closed_token().cancel();
    }

    fn on_packet(&self, packet: VariablePacket) {
        trace!("Received PACKET {:?}", packet);
        match packet {
            VariablePacket::PingrespPacket(..) => {
                info!("Receiving PINGRESP from broker ..");
            }
            VariablePacket::SubackPacket(ref ack) => self.resolve_ack(ack.packet_identifier()),
            VariablePacket::UnsubackPacket(ref ack) => self.resolve_ack(ack.packet_identifier()),
            VariablePacket::PublishPacket(ref publ) => self.on_publish(publ),
            _ => {}
        }
    }

    fn resolve_ack(&self, packet_id: u16) {
        let sender = self.shared.lock().unwrap().pending_acks.remove(&packet_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(());
            }
            None => trace!("Dropping unexpected ack for packet id {}", packet_id),
        }
    }

    fn on_publish(&self, publ: &PublishPacket) {
        let mut message = Message::new(publ.payload_ref()[..].to_vec());
        trace!("PUBLISH ({}): {:?}", publ.topic_name(), message);

        match self.matcher.classify(publ.topic_name()) {
            InboundTopic::TwinResponse {
                status,
                request_id,
                version,
            } => {
                let pending = self.shared.lock().unwrap().pending_twin.remove(&request_id);
                match pending {
                    Some(sender) => {
                        let _ = sender.send(TwinResponse {
                            status,
                            request_id,
                            version,
                            body: message.body,
                        });
                    }
                    // Request already timed out, was canceled, or never existed
                    None => trace!("Dropping twin response with no pending request, rid = {}", request_id),
                }
            }
            InboundTopic::TwinDesiredPatch { properties } => {
                if self.subscribed(TopicFamily::TwinPatch) {
                    // carries the `$version` of the patched twin document
                    topic::apply_properties(&mut message, properties);
                    self.dispatch(MessageType::DesiredPropertyUpdate(message));
                }
            }
            InboundTopic::MethodRequest {
                method_name,
                request_id,
            } => {
                if self.subscribed(TopicFamily::Methods) {
                    self.dispatch(MessageType::DirectMethod(DirectMethodInvocation {
                        method_name: method_name.to_string(),
                        message,
                        request_id,
                    }));
                }
            }
            InboundTopic::DeviceBound { properties } => {
                if self.subscribed(TopicFamily::DeviceBound) {
                    topic::apply_properties(&mut message, properties);
                    self.dispatch(MessageType::C2DMessage(message));
                }
            }
            InboundTopic::InputEvent {
                input_name,
                properties,
            } => {
                if self.subscribed(TopicFamily::InputEvents) {
                    topic::apply_properties(&mut message, properties);
                    if let Some(input_name) = input_name {
                        message
                            .system_properties
                            .insert(INPUT_NAME_PROPERTY.to_string(), input_name.to_string());
                    }
                    self.dispatch(MessageType::InputEvent(message));
                }
            }
            InboundTopic::Unknown => {
                trace!("Dropping publish on unrecognized topic {}", publ.topic_name());
            }
        }
    }

    fn subscribed(&self, family: TopicFamily) -> bool {
        self.shared.lock().unwrap().subscriptions.get(family)
    }

    fn dispatch(&self, event: MessageType) {
        // only fails when the handler itself is gone
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::FakeChannel;
    use crate::settings::SasTokenSource;
    use std::time::Duration as StdDuration;

    fn handler_with(fake: &Arc<FakeChannel>, settings: TransportSettings) -> MqttTransportHandler {
        let channel = Arc::clone(fake);
        let factory: ChannelFactory = Arc::new(move |_, _| Arc::clone(&channel) as Arc<dyn Channel>);
        MqttTransportHandler::with_channel_factory(settings, SasTokenSource::new("sas"), factory)
    }

    fn settings() -> TransportSettings {
        let mut settings = TransportSettings::new("myhub.azure-devices.net", "dev1");
        settings.ack_timeout = StdDuration::from_millis(200);
        settings.twin_timeout = StdDuration::from_millis(200);
        settings
    }

    #[tokio::test]
    async fn open_failure_surfaces_as_communication_fault() {
        let fake = FakeChannel::failing_open();
        let handler = handler_with(&fake, settings());
        let err = handler.open(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, IoTHubError::Communication(_)));
    }

    #[tokio::test]
    async fn precanceled_token_writes_nothing() {
        let fake = FakeChannel::new();
        let handler = handler_with(&fake, settings());
        handler.open(&CancellationToken::new()).await.unwrap();

        let ct = CancellationToken::new();
        ct.cancel();

        let err = handler
            .send_message(Message::new(b"hi".to_vec()), &ct)
            .await
            .unwrap_err();
        assert!(matches!(err, IoTHubError::Canceled));

        let err = handler.enable_methods(&ct).await.unwrap_err();
        assert!(matches!(err, IoTHubError::Canceled));

        let err = handler.send_twin_get(&ct).await.unwrap_err();
        assert!(matches!(err, IoTHubError::Canceled));

        assert!(fake.written().is_empty());
    }

    #[tokio::test]
    async fn enabling_twice_subscribes_once() {
        let fake = FakeChannel::new();
        let handler = handler_with(&fake, settings());
        let ct = CancellationToken::new();
        handler.open(&ct).await.unwrap();

        handler.enable_methods(&ct).await.unwrap();
        handler.enable_methods(&ct).await.unwrap();

        let subscribes = fake
            .written()
            .iter()
            .filter(|p| matches!(p, VariablePacket::SubscribePacket(_)))
            .count();
        assert_eq!(subscribes, 1);
    }

    #[tokio::test]
    async fn disabling_when_never_enabled_writes_nothing() {
        let fake = FakeChannel::new();
        let handler = handler_with(&fake, settings());
        let ct = CancellationToken::new();
        handler.open(&ct).await.unwrap();

        handler.disable_methods(&ct).await.unwrap();
        handler.disable_twin_patch(&ct).await.unwrap();
        handler.disable_receive_message(&ct).await.unwrap();

        assert!(fake.written().is_empty());
    }

    #[tokio::test]
    async fn twin_timeout_removes_pending_entry_and_late_response_is_dropped() {
        let fake = FakeChannel::new();
        let handler = handler_with(&fake, settings());
        let ct = CancellationToken::new();
        handler.open(&ct).await.unwrap();

        let err = handler.send_twin_get(&ct).await.unwrap_err();
        assert!(matches!(err, IoTHubError::Timeout { .. }));
        assert_eq!(handler.pending_twin_len(), 0);

        // The response for the expired request id must be ignored
        fake.inject_twin_response(200, "1", b"{}".to_vec());
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(handler.pending_twin_len(), 0);
    }

    #[tokio::test]
    async fn canceled_twin_request_removes_its_pending_entry() {
        let fake = FakeChannel::new();
        let handler = handler_with(&fake, settings());
        let ct = CancellationToken::new();
        handler.open(&ct).await.unwrap();

        let op_ct = CancellationToken::new();
        let cancel = op_ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = handler.send_twin_get(&op_ct).await.unwrap_err();
        assert!(matches!(err, IoTHubError::Canceled));
        assert_eq!(handler.pending_twin_len(), 0);
    }

    #[tokio::test]
    async fn error_unblocks_receiver_and_is_idempotent() {
        let fake = FakeChannel::new();
        let handler = handler_with(&fake, settings());
        let ct = CancellationToken::new();
        handler.open(&ct).await.unwrap();

        fake.inject(Err(IoTHubError::Protocol("broken pipe".to_string())));

        let err = handler.receive(&ct).await.unwrap_err();
        assert!(matches!(err, IoTHubError::TransportClosed(_)));

        // A second fault must neither panic nor re-trigger completed waiters
        handler
            .core
            .on_error(IoTHubError::Protocol("again".to_string()));

        let closed = handler.wait_for_transport_closed().await.unwrap_err();
        match closed {
            IoTHubError::TransportClosed(cause) => assert!(cause.contains("broken pipe")),
            other => panic!("unexpected fault {:?}", other),
        }
    }

    #[tokio::test]
    async fn open_after_fault_reports_the_fault() {
        let fake = FakeChannel::new();
        let handler = handler_with(&fake, settings());
        let ct = CancellationToken::new();
        handler.open(&ct).await.unwrap();

        fake.inject(Err(IoTHubError::Protocol("broken pipe".to_string())));
        handler.wait_for_transport_closed().await.unwrap_err();

        let err = handler.open(&ct).await.unwrap_err();
        assert!(matches!(err, IoTHubError::TransportClosed(_)));
    }

    #[tokio::test]
    async fn close_releases_pending_receive() {
        let fake = FakeChannel::new();
        let handler = Arc::new(handler_with(&fake, settings()));
        let ct = CancellationToken::new();
        handler.open(&ct).await.unwrap();

        let receiver = Arc::clone(&handler);
        let pending = tokio::spawn(async move {
            receiver.receive(&CancellationToken::new()).await
        });

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        handler.close().await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, IoTHubError::TransportClosed(_)));
        assert!(handler.wait_for_transport_closed().await.is_ok());
    }

    #[tokio::test]
    async fn operations_fail_before_open() {
        let fake = FakeChannel::new();
        let handler = handler_with(&fake, settings());
        let ct = CancellationToken::new();
        let err = handler
            .send_message(Message::new(vec![]), &ct)
            .await
            .unwrap_err();
        assert!(matches!(err, IoTHubError::InvalidState(_)));
    }
}
