//! Application-facing client.
//!
//! [`Client`] sits on top of a [`Connection`]: once the session is
//! authorized it runs the initialization sequence from [`ClientOptions`],
//! keeps a registry of the device's entities and republishes device traffic
//! as [`ClientEvent`]s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use protocol::messages::{
    BluetoothLEAdvertisementResponse, BluetoothLERawAdvertisement, DeviceInfoResponse, LogLevel,
    SubscribeLogsResponse, VoiceAssistantAudio, VoiceAssistantRequest,
};
use protocol::{EntityKind, EntityState, Message};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{ClientOptions, ConnectionConfig};
use crate::connection::{Connection, ConnectionEvent, ListedEntity};
use crate::error::{ConnectionError, Result};

/// Buffer size for the client event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// One BLE advertisement, as parsed by the device or raw.
#[derive(Debug, Clone, PartialEq)]
pub enum BleAdvertisement {
    Parsed(BluetoothLEAdvertisementResponse),
    Raw(BluetoothLERawAdvertisement),
}

impl BleAdvertisement {
    pub fn address(&self) -> u64 {
        match self {
            BleAdvertisement::Parsed(ad) => ad.address,
            BleAdvertisement::Raw(ad) => ad.address,
        }
    }
}

/// Notifications published by a [`Client`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The session is authorized.
    Connected,
    /// Authorization was lost.
    Disconnected,
    /// The initialization sequence finished.
    Initialized,
    DeviceInfo(DeviceInfoResponse),
    /// An entity was added to the registry.
    NewEntity(ListedEntity),
    State {
        kind: EntityKind,
        state: EntityState,
    },
    Logs(SubscribeLogsResponse),
    BleAdvertisement(BleAdvertisement),
    VoiceAssistantRequest(VoiceAssistantRequest),
    VoiceAssistantAudio(VoiceAssistantAudio),
    Error(Arc<ConnectionError>),
}

struct ClientInner {
    connection: Connection,
    options: ClientOptions,
    entities: Mutex<HashMap<u32, ListedEntity>>,
    device_info: Mutex<Option<DeviceInfoResponse>>,
    event_tx: broadcast::Sender<ClientEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    init_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Client for one device.
///
/// Cloning is cheap; clones share the client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client. Must be called within a tokio runtime.
    pub fn new(config: ConnectionConfig, options: ClientOptions) -> Result<Self> {
        let connection = Connection::new(config)?;
        let events = connection.subscribe();
        let messages = connection.subscribe_all_messages();
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);

        let inner = Arc::new(ClientInner {
            connection,
            options,
            entities: Mutex::new(HashMap::new()),
            device_info: Mutex::new(None),
            event_tx,
            pump: Mutex::new(None),
            init_task: Mutex::new(None),
        });

        let pump = tokio::spawn(pump(Arc::downgrade(&inner), events, messages));
        *lock(&inner.pump) = Some(pump);

        Ok(Self { inner })
    }

    /// Underlying session.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Subscribes to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn connect(&self) -> Result<()> {
        self.inner.connection.connect()
    }

    /// Ends the session for good.
    ///
    /// Unsubscribes from BLE advertisements first when the initialization
    /// sequence subscribed to them.
    pub fn disconnect(&self) {
        let connection = &self.inner.connection;
        // Unsubscribing requires authorization, not just a connection.
        if self.inner.options.initialize_subscribe_ble_advertisements && connection.is_authorized() {
            if let Err(error) = connection.unsubscribe_bluetooth_advertisements() {
                tracing::debug!(error = %error, "Failed to unsubscribe BLE advertisements");
            }
        }
        if let Some(task) = lock(&self.inner.init_task).take() {
            task.abort();
        }
        connection.disconnect();
    }

    /// Whether the session is authorized.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_authorized()
    }

    /// Device information from the last initialization.
    pub fn device_info(&self) -> Option<DeviceInfoResponse> {
        lock(&self.inner.device_info).clone()
    }

    pub fn entity(&self, key: u32) -> Option<ListedEntity> {
        lock(&self.inner.entities).get(&key).cloned()
    }

    /// Known entities ordered by key.
    pub fn entities(&self) -> Vec<ListedEntity> {
        let mut entities: Vec<_> = lock(&self.inner.entities).values().cloned().collect();
        entities.sort_by_key(|entity| entity.info.key);
        entities
    }

    /// Registers an entity and emits [`ClientEvent::NewEntity`].
    pub fn add_entity(&self, entity: ListedEntity) -> Result<()> {
        self.inner.add_entity(entity)
    }

    pub fn remove_entity(&self, key: u32) -> Result<ListedEntity> {
        lock(&self.inner.entities)
            .remove(&key)
            .ok_or(ConnectionError::UnknownEntity(key))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.inner.connection)
            .field("entities", &lock(&self.inner.entities).len())
            .finish()
    }
}

async fn pump(
    inner: Weak<ClientInner>,
    mut events: broadcast::Receiver<ConnectionEvent>,
    mut messages: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.handle_connection_event(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Client lagged behind connection events");
                }
                Err(RecvError::Closed) => break,
            },
            message = messages.recv() => match message {
                Some(message) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.handle_message(message);
                }
                None => break,
            },
        }
    }
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.event_tx.send(event);
    }

    fn add_entity(&self, entity: ListedEntity) -> Result<()> {
        {
            let mut entities = lock(&self.entities);
            if entities.contains_key(&entity.info.key) {
                return Err(ConnectionError::DuplicateEntity(entity.info.key));
            }
            entities.insert(entity.info.key, entity.clone());
        }
        self.emit(ClientEvent::NewEntity(entity));
        Ok(())
    }

    fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Authorized => {
                self.emit(ClientEvent::Connected);
                let weak = Arc::downgrade(self);
                let task = tokio::spawn(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.run_initialization().await;
                    }
                });
                if let Some(previous) = lock(&self.init_task).replace(task) {
                    previous.abort();
                }
            }
            ConnectionEvent::Unauthorized => {
                if let Some(task) = lock(&self.init_task).take() {
                    task.abort();
                }
                self.emit(ClientEvent::Disconnected);
            }
            ConnectionEvent::Error(error) => self.emit(ClientEvent::Error(error)),
            ConnectionEvent::Connected
            | ConnectionEvent::Disconnected
            | ConnectionEvent::ReconnectScheduled(_) => {}
        }
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::DeviceInfoResponse(info) => {
                *lock(&self.device_info) = Some(info.clone());
                self.emit(ClientEvent::DeviceInfo(info));
            }
            Message::EntityState { kind, state, .. } => {
                self.emit(ClientEvent::State { kind, state });
            }
            Message::SubscribeLogsResponse(logs) => self.emit(ClientEvent::Logs(logs)),
            Message::BluetoothLEAdvertisementResponse(ad) => {
                self.emit(ClientEvent::BleAdvertisement(BleAdvertisement::Parsed(ad)));
            }
            Message::BluetoothLERawAdvertisementsResponse(batch) => {
                for ad in batch.advertisements {
                    self.emit(ClientEvent::BleAdvertisement(BleAdvertisement::Raw(ad)));
                }
            }
            Message::VoiceAssistantRequest(request) => {
                self.emit(ClientEvent::VoiceAssistantRequest(request));
            }
            Message::VoiceAssistantAudio(audio) => {
                self.emit(ClientEvent::VoiceAssistantAudio(audio));
            }
            // Listings outside the initialization sequence still register.
            Message::ListEntities { kind, info } => {
                let key = info.key;
                if self.add_entity(ListedEntity { kind, info }).is_err() {
                    tracing::trace!(key, "Entity already known");
                }
            }
            _ => {}
        }
    }

    async fn run_initialization(&self) {
        match self.initialize().await {
            Ok(()) => {
                tracing::debug!(
                    host = %self.connection.config().host,
                    entities = lock(&self.entities).len(),
                    "Client initialized"
                );
                self.emit(ClientEvent::Initialized);
            }
            Err(error) => {
                tracing::warn!(error = %error, "Client initialization failed");
                self.emit(ClientEvent::Error(Arc::new(error)));
                self.connection.end_transport();
            }
        }
    }

    async fn initialize(&self) -> Result<()> {
        let options = &self.options;
        let connection = &self.connection;

        if options.clear_session {
            lock(&self.entities).clear();
        }
        if options.initialize_device_info {
            connection.device_info().await?;
        }
        if options.initialize_list_entities {
            for entity in connection.list_entities().await? {
                let key = entity.info.key;
                if self.add_entity(entity).is_err() {
                    tracing::debug!(key, "Entity already known");
                }
            }
        }
        if options.initialize_subscribe_states {
            connection.subscribe_states()?;
        }
        if let Some(logs) = &options.initialize_subscribe_logs {
            let level = logs.log_level().unwrap_or_else(|| {
                tracing::warn!(level = %logs.level, "Unknown log level, using debug");
                LogLevel::Debug
            });
            connection.subscribe_logs(level, logs.dump_config)?;
        }
        if options.initialize_subscribe_ble_advertisements {
            connection.subscribe_bluetooth_advertisements()?;
        }
        if options.initialize_subscribe_home_assistant_states {
            connection.subscribe_home_assistant_states()?;
        }
        if options.initialize_subscribe_home_assistant_services {
            connection.subscribe_home_assistant_services()?;
        }
        Ok(())
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for slot in [&mut self.pump, &mut self.init_task] {
            let handle = slot
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(handle) = handle {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::messages::BluetoothLERawAdvertisementsResponse;
    use protocol::EntityInfo;

    fn client() -> Client {
        Client::new(
            ConnectionConfig::new("127.0.0.1").with_reconnect(false),
            ClientOptions::default(),
        )
        .unwrap()
    }

    fn entity(key: u32) -> ListedEntity {
        ListedEntity {
            kind: EntityKind::Switch,
            info: EntityInfo::with_header(format!("switch_{key}"), key, "Switch", "sw"),
        }
    }

    #[tokio::test]
    async fn test_add_entity_rejects_duplicates() {
        let client = client();
        let mut events = client.subscribe();

        client.add_entity(entity(7)).unwrap();
        assert_eq!(
            client.add_entity(entity(7)),
            Err(ConnectionError::DuplicateEntity(7))
        );
        assert!(matches!(
            events.try_recv(),
            Ok(ClientEvent::NewEntity(e)) if e.info.key == 7
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_entity_rejects_unknown_key() {
        let client = client();
        client.add_entity(entity(1)).unwrap();

        assert_eq!(client.remove_entity(1).unwrap().info.key, 1);
        assert_eq!(client.remove_entity(1), Err(ConnectionError::UnknownEntity(1)));
        assert!(client.entities().is_empty());
    }

    #[tokio::test]
    async fn test_entities_sorted_by_key() {
        let client = client();
        for key in [30, 10, 20] {
            client.add_entity(entity(key)).unwrap();
        }
        let keys: Vec<u32> = client.entities().iter().map(|e| e.info.key).collect();
        assert_eq!(keys, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_raw_advertisements_are_flattened() {
        let client = client();
        let mut events = client.subscribe();

        let batch = BluetoothLERawAdvertisementsResponse {
            advertisements: (1..=3)
                .map(|address| BluetoothLERawAdvertisement {
                    address,
                    ..Default::default()
                })
                .collect(),
        };
        client.inner.handle_message(batch.into());

        for expected in 1..=3 {
            match events.try_recv() {
                Ok(ClientEvent::BleAdvertisement(ad)) => assert_eq!(ad.address(), expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_device_info_is_recorded() {
        let client = client();
        let info = DeviceInfoResponse {
            name: "garage".to_string(),
            ..Default::default()
        };
        client.inner.handle_message(info.into());
        assert_eq!(client.device_info().unwrap().name, "garage");
    }

    #[tokio::test]
    async fn test_late_listing_registers_entity_once() {
        let client = client();
        let mut events = client.subscribe();
        let listed = entity(42);

        let message = Message::ListEntities {
            kind: listed.kind,
            info: listed.info.clone(),
        };
        client.inner.handle_message(message.clone());
        client.inner.handle_message(message);

        assert_eq!(client.entity(42), Some(listed));
        assert!(matches!(
            events.try_recv(),
            Ok(ClientEvent::NewEntity(e)) if e.info.key == 42
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_disconnected() {
        let client = client();
        let mut events = client.subscribe();
        client
            .inner
            .handle_connection_event(ConnectionEvent::Unauthorized);
        assert!(matches!(events.try_recv(), Ok(ClientEvent::Disconnected)));
    }
}
