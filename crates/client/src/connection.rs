//! Session state machine and request correlation.
//!
//! A [`Connection`] owns one [`FrameTransport`] and drives it through
//! hello, credential exchange, keepalive and reconnection. Inbound messages
//! are processed one at a time by a driver task and dispatched, in order, to:
//!
//! 1. built-in handlers (ping, time and disconnect requests from the device)
//! 2. the one waiter registered for that reply type, if any
//! 3. typed subscribers ([`Connection::subscribe_messages`])
//! 4. generic subscribers ([`Connection::subscribe_all_messages`])
//!
//! Lifecycle changes are published as [`ConnectionEvent`]s on a broadcast
//! channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use protocol::messages::{
    BluetoothDeviceConnectionResponse, BluetoothDevicePairingResponse, BluetoothDeviceRequest,
    BluetoothDeviceRequestType, BluetoothDeviceUnpairingResponse, BluetoothGATTGetServicesRequest,
    BluetoothGATTNotifyRequest, BluetoothGATTNotifyResponse, BluetoothGATTReadDescriptorRequest,
    BluetoothGATTReadRequest, BluetoothGATTReadResponse, BluetoothGATTService,
    BluetoothGATTWriteDescriptorRequest, BluetoothGATTWriteRequest, BluetoothGATTWriteResponse,
    CameraImageRequest, ConnectRequest, ConnectResponse, DeviceInfoRequest, DeviceInfoResponse,
    DisconnectRequest, DisconnectResponse, GetTimeRequest, GetTimeResponse, HelloRequest,
    HelloResponse, ListEntitiesRequest, LogLevel, PingRequest, PingResponse,
    SubscribeBluetoothLEAdvertisementsRequest, SubscribeHomeAssistantStatesRequest,
    SubscribeHomeassistantServicesRequest, SubscribeLogsRequest, SubscribeStatesRequest,
    SubscribeVoiceAssistantRequest, UnsubscribeBluetoothLEAdvertisementsRequest,
    VoiceAssistantEvent, VoiceAssistantEventData, VoiceAssistantEventResponse,
    VoiceAssistantResponse, BLUETOOTH_ADVERTISEMENTS_RAW,
};
use protocol::{EntityInfo, EntityKind, Message, MessageType, TypedMessage};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, Result};
use crate::transport::{FrameTransport, TransportConfig, TransportEvent};

/// Buffer size for the lifecycle event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 64;

/// Timeout for Bluetooth connect, pair and unpair requests.
pub const BLUETOOTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// First API version that can relay raw BLE advertisements.
const RAW_BLE_ADVERTISEMENTS_VERSION: (u32, u32) = (1, 9);

/// Lifecycle notifications published by a [`Connection`].
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The socket is open (and the handshake done, when encrypted).
    Connected,
    /// The socket closed.
    Disconnected,
    /// Hello and credential exchange succeeded.
    Authorized,
    /// Authorization was lost, always before `Disconnected`.
    Unauthorized,
    /// A reconnect attempt will start after this delay.
    ReconnectScheduled(Duration),
    /// A transport, protocol or auto-reply failure.
    Error(Arc<ConnectionError>),
}

/// One record returned by [`Connection::list_entities`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntity {
    pub kind: EntityKind,
    pub info: EntityInfo,
}

impl ListedEntity {
    /// Component label, e.g. `"BinarySensor"`.
    pub fn component(&self) -> &'static str {
        self.kind.label()
    }
}

/// GATT services collected for one device address.
#[derive(Debug, Clone, PartialEq)]
pub struct GattServices {
    pub address: u64,
    pub services: Vec<BluetoothGATTService>,
}

/// Which session state an outbound message requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Connected,
    Authorized,
}

#[derive(Default)]
struct SessionState {
    connected: bool,
    authorized: bool,
    destroyed: bool,
    reconnect: bool,
    ping_failures: u32,
    api_version: Option<(u32, u32)>,
    driver: Option<JoinHandle<()>>,
    authorize_task: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl SessionState {
    fn stop_session_tasks(&mut self) {
        for task in [self.authorize_task.take(), self.keepalive.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }

    fn stop_all_tasks(&mut self) {
        self.stop_session_tasks();
        for task in [self.reconnect_timer.take(), self.driver.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

type Reply = oneshot::Sender<Result<Message>>;

struct Waiter {
    id: u64,
    reply: Reply,
}

struct Inner {
    config: ConnectionConfig,
    transport: FrameTransport,
    state: Mutex<SessionState>,
    waiters: Mutex<HashMap<MessageType, Waiter>>,
    subscribers: Mutex<HashMap<MessageType, Vec<mpsc::UnboundedSender<Message>>>>,
    all_subscribers: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    next_waiter_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes its waiter when the awaiting future finishes or is dropped.
struct WaiterGuard<'a> {
    inner: &'a Inner,
    message_type: MessageType,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut waiters = lock(&self.inner.waiters);
        if waiters
            .get(&self.message_type)
            .is_some_and(|waiter| waiter.id == self.id)
        {
            waiters.remove(&self.message_type);
        }
    }
}

/// A session with one device.
///
/// Cloning is cheap; clones share the session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates an idle session. Must be called within a tokio runtime.
    ///
    /// Fails with [`ConnectionError::HostRequired`] for an empty host and
    /// with a protocol error for a malformed encryption key, before any
    /// socket activity.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        if config.host.trim().is_empty() {
            return Err(ConnectionError::HostRequired);
        }
        let encryption_key = config.parsed_encryption_key()?;

        let (transport, events) = FrameTransport::new(TransportConfig {
            host: config.host.clone(),
            port: config.port,
            encryption_key,
            expected_server_name: config.expected_server_name.clone(),
            connect_timeout: config.connect_timeout,
        });
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);

        let inner = Arc::new(Inner {
            state: Mutex::new(SessionState {
                reconnect: config.reconnect,
                ..Default::default()
            }),
            config,
            transport,
            waiters: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            all_subscribers: Mutex::new(Vec::new()),
            event_tx,
            next_waiter_id: AtomicU64::new(1),
        });

        let driver = tokio::spawn(drive(Arc::downgrade(&inner), events));
        lock(&inner.state).driver = Some(driver);

        Ok(Self { inner })
    }

    /// Session configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).connected
    }

    pub fn is_authorized(&self) -> bool {
        lock(&self.inner.state).authorized
    }

    /// API version reported by the device in its last hello.
    pub fn api_version(&self) -> Option<(u32, u32)> {
        lock(&self.inner.state).api_version
    }

    /// Whether the device can relay raw BLE advertisements.
    pub fn supports_raw_ble_advertisements(&self) -> bool {
        self.api_version()
            .is_some_and(|version| version >= RAW_BLE_ADVERTISEMENTS_VERSION)
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Subscribes to every inbound message of one type.
    ///
    /// The subscription ends when the receiver is dropped.
    pub fn subscribe_messages(&self, message_type: MessageType) -> mpsc::UnboundedReceiver<Message> {
        self.subscribe_message_types([message_type])
    }

    /// Subscribes to several message types through one receiver, which sees
    /// them in arrival order.
    pub fn subscribe_message_types(
        &self,
        message_types: impl IntoIterator<Item = MessageType>,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = lock(&self.inner.subscribers);
        for message_type in message_types {
            subscribers.entry(message_type).or_default().push(tx.clone());
        }
        rx
    }

    /// Subscribes to every inbound message.
    pub fn subscribe_all_messages(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.all_subscribers).push(tx);
        rx
    }

    /// Starts connecting. Progress is reported through [`Self::subscribe`].
    pub fn connect(&self) -> Result<()> {
        {
            let state = lock(&self.inner.state);
            if state.destroyed {
                return Err(ConnectionError::Destroyed);
            }
            if state.connected {
                return Err(ConnectionError::AlreadyConnected);
            }
        }
        self.inner.transport.connect()?;
        Ok(())
    }

    /// Ends the session for good.
    ///
    /// Disables reconnection, stops timers, sends a best-effort disconnect
    /// notice and closes the transport. Outstanding requests fail with
    /// [`ConnectionError::Destroyed`] and message subscriptions end.
    ///
    /// Lifecycle receivers from [`Self::subscribe`] stay attached so they
    /// still observe the final `Unauthorized` and `Disconnected` events;
    /// they close once the last handle to the session is dropped.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut state = lock(&self.inner.state);
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.reconnect = false;
            state.ping_failures = 0;
            state.stop_session_tasks();
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            state.connected
        };

        if was_connected {
            let _ = self.inner.transport.send(&DisconnectRequest {}.into());
        }
        self.inner.set_connected(false);
        self.inner.fail_waiters(ConnectionError::Destroyed);
        lock(&self.inner.subscribers).clear();
        lock(&self.inner.all_subscribers).clear();
        self.inner.transport.destroy();
        tracing::debug!(host = %self.inner.config.host, "Connection destroyed");
    }

    /// Closes the transport without ending the session; reconnection still
    /// applies.
    pub(crate) fn end_transport(&self) {
        self.inner.transport.end();
    }

    /// Sends a message. Requires authorization.
    pub fn send_message(&self, message: impl Into<Message>) -> Result<()> {
        self.inner.send(message.into(), Access::Authorized)
    }

    /// Sends `message` and waits for the next inbound message of `expected`.
    ///
    /// At most one request may wait for a given reply type; a second one
    /// fails with [`ConnectionError::AlreadyAwaiting`] and sends nothing.
    pub async fn send_message_await_response(
        &self,
        message: impl Into<Message>,
        expected: MessageType,
        timeout: Duration,
    ) -> Result<Message> {
        self.inner
            .await_response(message.into(), expected, timeout, Access::Authorized)
            .await
    }

    /// Typed form of [`Self::send_message_await_response`].
    pub async fn request<R: TypedMessage>(
        &self,
        message: impl Into<Message>,
        timeout: Duration,
    ) -> Result<R> {
        self.inner
            .request(message.into(), timeout, Access::Authorized)
            .await
    }

    // ------------------------------------------------------------------
    // Session services
    // ------------------------------------------------------------------

    /// Hello exchange. Only requires a connected transport.
    pub async fn hello(&self) -> Result<HelloResponse> {
        self.inner.hello().await
    }

    /// Credential exchange. Only requires a connected transport.
    pub async fn authenticate(&self, password: impl Into<String>) -> Result<ConnectResponse> {
        self.inner
            .request(
                ConnectRequest {
                    password: password.into(),
                }
                .into(),
                self.inner.config.request_timeout,
                Access::Connected,
            )
            .await
    }

    /// Asks the device to close the session. The transport is torn down
    /// when the response arrives.
    pub async fn disconnect_request(&self) -> Result<DisconnectResponse> {
        self.request(DisconnectRequest {}, self.default_timeout()).await
    }

    pub async fn ping(&self) -> Result<PingResponse> {
        self.request(PingRequest {}, self.default_timeout()).await
    }

    pub async fn device_info(&self) -> Result<DeviceInfoResponse> {
        self.request(DeviceInfoRequest {}, self.default_timeout()).await
    }

    pub async fn get_time(&self) -> Result<GetTimeResponse> {
        self.request(GetTimeRequest {}, self.default_timeout()).await
    }

    /// Lists the device's entities in arrival order.
    ///
    /// Completes when the device reports the end of the listing, which may
    /// follow zero entities.
    pub async fn list_entities(&self) -> Result<Vec<ListedEntity>> {
        self.inner.check(Access::Authorized)?;
        let mut collected =
            self.subscribe_message_types(EntityKind::ALL.iter().map(|kind| kind.list_type()));

        let done = self
            .send_message_await_response(
                ListEntitiesRequest {},
                MessageType::ListEntitiesDoneResponse,
                self.default_timeout(),
            )
            .await;
        let mut entities = Vec::new();
        while let Ok(message) = collected.try_recv() {
            if let Message::ListEntities { kind, info } = message {
                entities.push(ListedEntity { kind, info });
            }
        }
        drop(collected);

        done.map(|_| entities)
    }

    pub fn subscribe_states(&self) -> Result<()> {
        self.send_message(SubscribeStatesRequest {})
    }

    pub fn subscribe_logs(&self, level: LogLevel, dump_config: bool) -> Result<()> {
        self.send_message(SubscribeLogsRequest {
            level: level as i32,
            dump_config,
        })
    }

    pub fn subscribe_home_assistant_services(&self) -> Result<()> {
        self.send_message(SubscribeHomeassistantServicesRequest {})
    }

    pub fn subscribe_home_assistant_states(&self) -> Result<()> {
        self.send_message(SubscribeHomeAssistantStatesRequest {})
    }

    pub fn camera_image(&self, single: bool, stream: bool) -> Result<()> {
        self.send_message(CameraImageRequest { single, stream })
    }

    /// Sends an already-encoded command body to an entity kind.
    pub fn entity_command(&self, kind: EntityKind, payload: Vec<u8>) -> Result<()> {
        let message = Message::entity_command(kind, payload)
            .ok_or(ConnectionError::UnsupportedCommand(kind))?;
        self.send_message(message)
    }

    // ------------------------------------------------------------------
    // Bluetooth proxy services
    // ------------------------------------------------------------------

    /// Subscribes to BLE advertisements, raw when the device supports it.
    pub fn subscribe_bluetooth_advertisements(&self) -> Result<()> {
        let flags = if self.supports_raw_ble_advertisements() {
            BLUETOOTH_ADVERTISEMENTS_RAW
        } else {
            0
        };
        self.send_message(SubscribeBluetoothLEAdvertisementsRequest { flags })
    }

    pub fn unsubscribe_bluetooth_advertisements(&self) -> Result<()> {
        self.send_message(UnsubscribeBluetoothLEAdvertisementsRequest {})
    }

    pub async fn bluetooth_device_connect(
        &self,
        address: u64,
        address_type: Option<u32>,
    ) -> Result<BluetoothDeviceConnectionResponse> {
        let request = BluetoothDeviceRequest {
            address,
            request_type: BluetoothDeviceRequestType::Connect as i32,
            has_address_type: address_type.is_some(),
            address_type: address_type.unwrap_or_default(),
        };
        self.request(request, BLUETOOTH_REQUEST_TIMEOUT).await
    }

    pub async fn bluetooth_device_disconnect(
        &self,
        address: u64,
    ) -> Result<BluetoothDeviceConnectionResponse> {
        self.request(
            device_request(address, BluetoothDeviceRequestType::Disconnect),
            self.default_timeout(),
        )
        .await
    }

    pub async fn bluetooth_device_pair(&self, address: u64) -> Result<BluetoothDevicePairingResponse> {
        self.request(
            device_request(address, BluetoothDeviceRequestType::Pair),
            BLUETOOTH_REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn bluetooth_device_unpair(
        &self,
        address: u64,
    ) -> Result<BluetoothDeviceUnpairingResponse> {
        self.request(
            device_request(address, BluetoothDeviceRequestType::Unpair),
            BLUETOOTH_REQUEST_TIMEOUT,
        )
        .await
    }

    /// Collects the GATT services of a connected BLE device.
    pub async fn list_bluetooth_gatt_services(&self, address: u64) -> Result<GattServices> {
        self.inner.check(Access::Authorized)?;
        let mut collected = self.subscribe_messages(MessageType::BluetoothGATTGetServicesResponse);

        let done = self
            .send_message_await_response(
                BluetoothGATTGetServicesRequest { address },
                MessageType::BluetoothGATTGetServicesDoneResponse,
                self.default_timeout(),
            )
            .await;
        let mut services = Vec::new();
        while let Ok(message) = collected.try_recv() {
            if let Message::BluetoothGATTGetServicesResponse(response) = message {
                if response.address == address {
                    services.extend(response.services);
                }
            }
        }
        drop(collected);

        done.map(|_| GattServices { address, services })
    }

    pub async fn bluetooth_gatt_read(
        &self,
        address: u64,
        handle: u32,
    ) -> Result<BluetoothGATTReadResponse> {
        self.request(BluetoothGATTReadRequest { address, handle }, self.default_timeout())
            .await
    }

    pub async fn bluetooth_gatt_write(
        &self,
        address: u64,
        handle: u32,
        data: Vec<u8>,
        response: bool,
    ) -> Result<BluetoothGATTWriteResponse> {
        self.request(
            BluetoothGATTWriteRequest {
                address,
                handle,
                response,
                data,
            },
            self.default_timeout(),
        )
        .await
    }

    /// Enables notifications for a characteristic.
    pub async fn bluetooth_gatt_notify(
        &self,
        address: u64,
        handle: u32,
    ) -> Result<BluetoothGATTNotifyResponse> {
        self.request(
            BluetoothGATTNotifyRequest {
                address,
                handle,
                enable: true,
            },
            self.default_timeout(),
        )
        .await
    }

    pub async fn bluetooth_gatt_read_descriptor(
        &self,
        address: u64,
        handle: u32,
    ) -> Result<BluetoothGATTReadResponse> {
        self.request(
            BluetoothGATTReadDescriptorRequest { address, handle },
            self.default_timeout(),
        )
        .await
    }

    pub async fn bluetooth_gatt_write_descriptor(
        &self,
        address: u64,
        handle: u32,
        data: Vec<u8>,
    ) -> Result<BluetoothGATTWriteResponse> {
        self.request(
            BluetoothGATTWriteDescriptorRequest {
                address,
                handle,
                data,
            },
            self.default_timeout(),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Voice assistant services
    // ------------------------------------------------------------------

    pub fn subscribe_voice_assistant(&self, subscribe: bool, flags: u32) -> Result<()> {
        self.send_message(SubscribeVoiceAssistantRequest { subscribe, flags })
    }

    /// Tells the device where to stream audio, or that the run failed.
    pub fn voice_assistant_response(&self, port: u32, error: bool) -> Result<()> {
        self.send_message(VoiceAssistantResponse { port, error })
    }

    pub fn voice_assistant_event(
        &self,
        event: VoiceAssistantEvent,
        data: Vec<VoiceAssistantEventData>,
    ) -> Result<()> {
        self.send_message(VoiceAssistantEventResponse {
            event_type: event as i32,
            data,
        })
    }

    fn default_timeout(&self) -> Duration {
        self.inner.config.request_timeout
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Connection")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("connected", &state.connected)
            .field("authorized", &state.authorized)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

fn device_request(address: u64, request_type: BluetoothDeviceRequestType) -> BluetoothDeviceRequest {
    BluetoothDeviceRequest {
        address,
        request_type: request_type as i32,
        ..Default::default()
    }
}

fn epoch_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or_default()
}

/// Feeds transport events to the session one at a time.
async fn drive(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_transport_event(event);
    }
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.event_tx.send(event);
    }

    fn emit_error(&self, error: ConnectionError) {
        tracing::debug!(error = %error, "Connection error");
        self.emit(ConnectionEvent::Error(Arc::new(error)));
    }

    fn check(&self, access: Access) -> Result<()> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(ConnectionError::NotConnected);
        }
        if access == Access::Authorized && !state.authorized {
            return Err(ConnectionError::NotAuthorized);
        }
        Ok(())
    }

    fn send(&self, message: Message, access: Access) -> Result<()> {
        self.check(access)?;
        self.transport.send(&message)?;
        Ok(())
    }

    fn register_waiter(
        &self,
        message_type: MessageType,
    ) -> Result<(WaiterGuard<'_>, oneshot::Receiver<Result<Message>>)> {
        let mut waiters = lock(&self.waiters);
        if waiters.contains_key(&message_type) {
            return Err(ConnectionError::AlreadyAwaiting(message_type));
        }
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        waiters.insert(message_type, Waiter { id, reply });
        Ok((
            WaiterGuard {
                inner: self,
                message_type,
                id,
            },
            rx,
        ))
    }

    async fn await_response(
        &self,
        message: Message,
        expected: MessageType,
        timeout: Duration,
        access: Access,
    ) -> Result<Message> {
        self.check(access)?;
        let (_guard, rx) = self.register_waiter(expected)?;
        self.transport.send(&message)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::ConnectionClosed),
            Err(_) => Err(ConnectionError::Timeout(expected)),
        }
    }

    async fn request<R: TypedMessage>(
        &self,
        message: Message,
        timeout: Duration,
        access: Access,
    ) -> Result<R> {
        let reply = self
            .await_response(message, R::MESSAGE_TYPE, timeout, access)
            .await?;
        R::try_from(reply).map_err(|other| ConnectionError::UnexpectedResponse {
            expected: R::MESSAGE_TYPE,
            got: other.message_type(),
        })
    }

    fn fail_waiters(&self, error: ConnectionError) {
        let waiters: Vec<Waiter> = lock(&self.waiters).drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.reply.send(Err(error.clone()));
        }
    }

    async fn hello(&self) -> Result<HelloResponse> {
        let hello: HelloResponse = self
            .request(
                HelloRequest::new(self.config.client_info.clone()).into(),
                self.config.request_timeout,
                Access::Connected,
            )
            .await?;
        tracing::debug!(
            server_info = %hello.server_info,
            name = %hello.name,
            api_major = hello.api_version_major,
            api_minor = hello.api_version_minor,
            "Hello exchange complete"
        );
        lock(&self.state).api_version = Some((hello.api_version_major, hello.api_version_minor));
        Ok(hello)
    }

    /// Sets `connected`, emitting an event on change. Clearing it clears
    /// `authorized` first.
    fn set_connected(&self, connected: bool) -> bool {
        if !connected {
            self.set_authorized(false);
        }
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.connected != connected;
            state.connected = connected;
            changed
        };
        if changed {
            self.emit(if connected {
                ConnectionEvent::Connected
            } else {
                ConnectionEvent::Disconnected
            });
        }
        changed
    }

    /// Sets `authorized`, emitting an event on change. Refuses to authorize
    /// a session that is not connected.
    fn set_authorized(&self, authorized: bool) -> bool {
        let changed = {
            let mut state = lock(&self.state);
            if authorized && !state.connected {
                return false;
            }
            let changed = state.authorized != authorized;
            state.authorized = authorized;
            changed
        };
        if changed {
            self.emit(if authorized {
                ConnectionEvent::Authorized
            } else {
                ConnectionEvent::Unauthorized
            });
        }
        changed
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        if lock(&self.state).destroyed {
            if event == TransportEvent::Connected {
                self.transport.destroy();
            }
            return;
        }

        match event {
            TransportEvent::Connected => self.on_transport_connected(),
            TransportEvent::Message(message) => self.dispatch(message),
            TransportEvent::Error(error) => self.emit_error(error.into()),
            TransportEvent::Closed => self.on_transport_closed(),
        }
    }

    fn on_transport_connected(self: &Arc<Self>) {
        if let Some(timer) = lock(&self.state).reconnect_timer.take() {
            timer.abort();
        }
        self.set_connected(true);
        tracing::debug!(host = %self.config.host, "Transport connected, authorizing");

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.authorize().await;
            }
        });
        if let Some(previous) = lock(&self.state).authorize_task.replace(task) {
            previous.abort();
        }
    }

    async fn authorize(self: &Arc<Self>) {
        match self.exchange_credentials().await {
            Ok(()) => {
                if self.set_authorized(true) {
                    tracing::debug!(host = %self.config.host, "Authorized");
                    self.start_keepalive();
                }
            }
            Err(error) => {
                tracing::warn!(host = %self.config.host, error = %error, "Authorization failed");
                self.emit_error(error);
                self.transport.end();
            }
        }
    }

    async fn exchange_credentials(&self) -> Result<()> {
        self.hello().await?;
        let reply: ConnectResponse = self
            .request(
                ConnectRequest {
                    password: self.config.password.clone(),
                }
                .into(),
                self.config.request_timeout,
                Access::Connected,
            )
            .await?;
        if reply.invalid_password {
            return Err(ConnectionError::InvalidPassword);
        }
        Ok(())
    }

    fn start_keepalive(self: &Arc<Self>) {
        let period = self.config.keepalive_interval;
        if period.is_zero() {
            tracing::debug!("Keepalive disabled");
            return;
        }
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.keepalive_tick().await;
            }
        });
        if let Some(previous) = lock(&self.state).keepalive.replace(task) {
            previous.abort();
        }
    }

    async fn keepalive_tick(&self) {
        let result: Result<PingResponse> = self
            .request(
                PingRequest {}.into(),
                self.config.request_timeout,
                Access::Authorized,
            )
            .await;

        match result {
            Ok(_) => lock(&self.state).ping_failures = 0,
            Err(ConnectionError::AlreadyAwaiting(_)) => {
                // A ping of the caller's is in flight; its reply resets the count.
                tracing::debug!("Ping already in flight, skipping keepalive");
            }
            Err(error) => {
                let failures = {
                    let mut state = lock(&self.state);
                    state.ping_failures += 1;
                    state.ping_failures
                };
                let threshold = self.config.keepalive_failure_threshold;
                tracing::warn!(failures, threshold, error = %error, "Keepalive ping failed");
                if failures >= threshold {
                    tracing::warn!(host = %self.config.host, "Link is dead, closing transport");
                    self.transport.end();
                }
            }
        }
    }

    fn on_transport_closed(self: &Arc<Self>) {
        let reconnect = {
            let mut state = lock(&self.state);
            state.stop_session_tasks();
            state.ping_failures = 0;
            state.reconnect
        };

        self.set_connected(false);
        self.fail_waiters(ConnectionError::ConnectionClosed);

        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let interval = self.config.reconnect_interval;
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if lock(&inner.state).destroyed {
                return;
            }
            tracing::info!(host = %inner.config.host, "Reconnecting");
            if let Err(error) = inner.transport.connect() {
                tracing::debug!(error = %error, "Reconnect attempt skipped");
            }
        });
        if let Some(previous) = lock(&self.state).reconnect_timer.replace(timer) {
            previous.abort();
        }

        tracing::info!(
            host = %self.config.host,
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Reconnect scheduled"
        );
        self.emit(ConnectionEvent::ReconnectScheduled(interval));
    }

    fn dispatch(&self, message: Message) {
        let message_type = message.message_type();
        if message_type == MessageType::PingResponse {
            lock(&self.state).ping_failures = 0;
        }
        let mut handled = self.handle_builtin(&message);

        let waiter = lock(&self.waiters).remove(&message_type);
        if let Some(waiter) = waiter {
            let _ = waiter.reply.send(Ok(message.clone()));
            handled = true;
        }

        {
            let mut subscribers = lock(&self.subscribers);
            if let Some(list) = subscribers.get_mut(&message_type) {
                list.retain(|tx| tx.send(message.clone()).is_ok());
                if list.is_empty() {
                    subscribers.remove(&message_type);
                } else {
                    handled = true;
                }
            }
        }

        lock(&self.all_subscribers).retain(|tx| tx.send(message.clone()).is_ok());

        if !handled {
            tracing::debug!(message_type = %message_type, "Unhandled message");
        }
    }

    /// Answers the requests a device may send on its own.
    fn handle_builtin(&self, message: &Message) -> bool {
        match message {
            Message::DisconnectRequest(_) => {
                self.auto_reply(MessageType::DisconnectRequest, DisconnectResponse {}.into());
                self.transport.end();
                true
            }
            Message::DisconnectResponse(_) => {
                self.transport.destroy();
                true
            }
            Message::PingRequest(_) => {
                self.auto_reply(MessageType::PingRequest, PingResponse {}.into());
                true
            }
            Message::GetTimeRequest(_) => {
                let reply = GetTimeResponse {
                    epoch_seconds: epoch_seconds(),
                };
                self.auto_reply(MessageType::GetTimeRequest, reply.into());
                true
            }
            _ => false,
        }
    }

    fn auto_reply(&self, request: MessageType, reply: Message) {
        if let Err(source) = self.send(reply, Access::Connected) {
            self.emit_error(ConnectionError::AutoReply {
                request,
                source: Box::new(source),
            });
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .stop_all_tasks();
    }
}
