//! Native API message catalog.
//!
//! Every frame carries a numeric type identifier and a protobuf body. This
//! module maps identifiers to [`MessageType`]s and bodies to [`Message`]s.
//!
//! Control and service messages are modelled field by field. Entity records
//! (list-entities responses, state responses, commands) are only decoded as
//! far as their common header; the raw body is kept for the entity layer.

use prost::Message as ProstMessage;

use crate::entity::{EntityInfo, EntityKind, EntityState};
use crate::error::{ProtocolError, Result};
use crate::framing::RawFrame;

/// API version advertised in the hello request.
pub const API_VERSION_MAJOR: u32 = 1;

/// API version advertised in the hello request.
pub const API_VERSION_MINOR: u32 = 10;

macro_rules! message_types {
    ($($variant:ident = $id:literal),* $(,)?) => {
        /// Every message type the client recognizes, keyed by wire identifier.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum MessageType {
            $(
                #[allow(missing_docs)]
                $variant,
            )*
        }

        impl MessageType {
            /// All recognized message types in identifier order.
            pub const ALL: &'static [MessageType] = &[$(MessageType::$variant),*];

            /// Wire identifier of this message type.
            pub fn id(self) -> u32 {
                match self {
                    $(MessageType::$variant => $id,)*
                }
            }

            /// Look up a message type by wire identifier.
            pub fn from_id(id: u32) -> Option<Self> {
                match id {
                    $($id => Some(MessageType::$variant),)*
                    _ => None,
                }
            }

            /// Protocol name of this message type.
            pub fn name(self) -> &'static str {
                match self {
                    $(MessageType::$variant => stringify!($variant),)*
                }
            }
        }
    };
}

message_types! {
    HelloRequest = 1,
    HelloResponse = 2,
    ConnectRequest = 3,
    ConnectResponse = 4,
    DisconnectRequest = 5,
    DisconnectResponse = 6,
    PingRequest = 7,
    PingResponse = 8,
    DeviceInfoRequest = 9,
    DeviceInfoResponse = 10,
    ListEntitiesRequest = 11,
    ListEntitiesBinarySensorResponse = 12,
    ListEntitiesCoverResponse = 13,
    ListEntitiesFanResponse = 14,
    ListEntitiesLightResponse = 15,
    ListEntitiesSensorResponse = 16,
    ListEntitiesSwitchResponse = 17,
    ListEntitiesTextSensorResponse = 18,
    ListEntitiesDoneResponse = 19,
    SubscribeStatesRequest = 20,
    BinarySensorStateResponse = 21,
    CoverStateResponse = 22,
    FanStateResponse = 23,
    LightStateResponse = 24,
    SensorStateResponse = 25,
    SwitchStateResponse = 26,
    TextSensorStateResponse = 27,
    SubscribeLogsRequest = 28,
    SubscribeLogsResponse = 29,
    CoverCommandRequest = 30,
    FanCommandRequest = 31,
    LightCommandRequest = 32,
    SwitchCommandRequest = 33,
    SubscribeHomeassistantServicesRequest = 34,
    HomeassistantServiceResponse = 35,
    GetTimeRequest = 36,
    GetTimeResponse = 37,
    SubscribeHomeAssistantStatesRequest = 38,
    SubscribeHomeAssistantStateResponse = 39,
    HomeAssistantStateResponse = 40,
    ListEntitiesServicesResponse = 41,
    ExecuteServiceRequest = 42,
    ListEntitiesCameraResponse = 43,
    CameraImageResponse = 44,
    CameraImageRequest = 45,
    ListEntitiesClimateResponse = 46,
    ClimateStateResponse = 47,
    ClimateCommandRequest = 48,
    ListEntitiesNumberResponse = 49,
    NumberStateResponse = 50,
    NumberCommandRequest = 51,
    ListEntitiesSelectResponse = 52,
    SelectStateResponse = 53,
    SelectCommandRequest = 54,
    ListEntitiesSirenResponse = 55,
    SirenStateResponse = 56,
    SirenCommandRequest = 57,
    ListEntitiesLockResponse = 58,
    LockStateResponse = 59,
    LockCommandRequest = 60,
    ListEntitiesButtonResponse = 61,
    ButtonCommandRequest = 62,
    ListEntitiesMediaPlayerResponse = 63,
    MediaPlayerStateResponse = 64,
    MediaPlayerCommandRequest = 65,
    SubscribeBluetoothLEAdvertisementsRequest = 66,
    BluetoothLEAdvertisementResponse = 67,
    BluetoothDeviceRequest = 68,
    BluetoothDeviceConnectionResponse = 69,
    BluetoothGATTGetServicesRequest = 70,
    BluetoothGATTGetServicesResponse = 71,
    BluetoothGATTGetServicesDoneResponse = 72,
    BluetoothGATTReadRequest = 73,
    BluetoothGATTReadResponse = 74,
    BluetoothGATTWriteRequest = 75,
    BluetoothGATTReadDescriptorRequest = 76,
    BluetoothGATTWriteDescriptorRequest = 77,
    BluetoothGATTNotifyRequest = 78,
    BluetoothGATTNotifyDataResponse = 79,
    SubscribeBluetoothConnectionsFreeRequest = 80,
    BluetoothConnectionsFreeResponse = 81,
    BluetoothGATTErrorResponse = 82,
    BluetoothGATTWriteResponse = 83,
    BluetoothGATTNotifyResponse = 84,
    BluetoothDevicePairingResponse = 85,
    BluetoothDeviceUnpairingResponse = 86,
    UnsubscribeBluetoothLEAdvertisementsRequest = 87,
    BluetoothDeviceClearCacheResponse = 88,
    SubscribeVoiceAssistantRequest = 89,
    VoiceAssistantRequest = 90,
    VoiceAssistantResponse = 91,
    VoiceAssistantEventResponse = 92,
    BluetoothLERawAdvertisementsResponse = 93,
    ListEntitiesAlarmControlPanelResponse = 94,
    AlarmControlPanelStateResponse = 95,
    AlarmControlPanelCommandRequest = 96,
    ListEntitiesTextResponse = 97,
    TextStateResponse = 98,
    TextCommandRequest = 99,
    ListEntitiesDateResponse = 100,
    DateStateResponse = 101,
    DateCommandRequest = 102,
    ListEntitiesTimeResponse = 103,
    TimeStateResponse = 104,
    TimeCommandRequest = 105,
    VoiceAssistantAudio = 106,
    ListEntitiesEventResponse = 107,
    EventResponse = 108,
    ListEntitiesValveResponse = 109,
    ValveStateResponse = 110,
    ValveCommandRequest = 111,
    ListEntitiesDateTimeResponse = 112,
    DateTimeStateResponse = 113,
    DateTimeCommandRequest = 114,
    VoiceAssistantTimerEventResponse = 115,
    ListEntitiesUpdateResponse = 116,
    UpdateStateResponse = 117,
    UpdateCommandRequest = 118,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A message with a statically known type.
pub trait TypedMessage: Into<Message> + TryFrom<Message, Error = Message> {
    /// Message type of this struct.
    const MESSAGE_TYPE: MessageType;
}

macro_rules! messages {
    ($($name:ident),* $(,)?) => {
        /// A decoded native API message.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $(
                #[allow(missing_docs)]
                $name($name),
            )*
            /// One entity record from an entity listing.
            ListEntities {
                /// Component kind of the record.
                kind: EntityKind,
                /// Common header plus the raw record.
                info: EntityInfo,
            },
            /// A state update for one entity.
            EntityState {
                /// Wire type of the state response.
                message_type: MessageType,
                /// Component kind of the entity.
                kind: EntityKind,
                /// Entity key plus the raw state body.
                state: EntityState,
            },
            /// An entity command with a body encoded by the entity layer.
            EntityCommand {
                /// Wire type of the command request.
                message_type: MessageType,
                /// Component kind the command targets.
                kind: EntityKind,
                /// Protobuf-encoded command body.
                payload: Vec<u8>,
            },
            /// A recognized message type without a dedicated model.
            Other {
                /// Wire type of the message.
                message_type: MessageType,
                /// Undecoded protobuf body.
                payload: Vec<u8>,
            },
        }

        impl Message {
            /// Wire type of this message.
            pub fn message_type(&self) -> MessageType {
                match self {
                    $(Message::$name(_) => MessageType::$name,)*
                    Message::ListEntities { kind, .. } => kind.list_type(),
                    Message::EntityState { message_type, .. }
                    | Message::EntityCommand { message_type, .. }
                    | Message::Other { message_type, .. } => *message_type,
                }
            }

            /// Protobuf body of this message.
            pub fn encode_body(&self) -> Vec<u8> {
                match self {
                    $(Message::$name(m) => m.encode_to_vec(),)*
                    Message::ListEntities { info, .. } => info.raw.clone(),
                    Message::EntityState { state, .. } => state.raw.clone(),
                    Message::EntityCommand { payload, .. } | Message::Other { payload, .. } => {
                        payload.clone()
                    }
                }
            }

            fn decode_typed(
                message_type: MessageType,
                payload: &[u8],
            ) -> std::result::Result<Message, prost::DecodeError> {
                match message_type {
                    $(MessageType::$name => Ok(Message::$name($name::decode(payload)?)),)*
                    other => Self::decode_entity(other, payload),
                }
            }
        }

        $(
            impl From<$name> for Message {
                fn from(message: $name) -> Self {
                    Message::$name(message)
                }
            }

            impl TryFrom<Message> for $name {
                type Error = Message;

                fn try_from(message: Message) -> std::result::Result<Self, Message> {
                    match message {
                        Message::$name(m) => Ok(m),
                        other => Err(other),
                    }
                }
            }

            impl TypedMessage for $name {
                const MESSAGE_TYPE: MessageType = MessageType::$name;
            }
        )*
    };
}

messages! {
    HelloRequest,
    HelloResponse,
    ConnectRequest,
    ConnectResponse,
    DisconnectRequest,
    DisconnectResponse,
    PingRequest,
    PingResponse,
    DeviceInfoRequest,
    DeviceInfoResponse,
    ListEntitiesRequest,
    ListEntitiesDoneResponse,
    SubscribeStatesRequest,
    SubscribeLogsRequest,
    SubscribeLogsResponse,
    SubscribeHomeassistantServicesRequest,
    GetTimeRequest,
    GetTimeResponse,
    SubscribeHomeAssistantStatesRequest,
    CameraImageResponse,
    CameraImageRequest,
    SubscribeBluetoothLEAdvertisementsRequest,
    BluetoothLEAdvertisementResponse,
    BluetoothDeviceRequest,
    BluetoothDeviceConnectionResponse,
    BluetoothGATTGetServicesRequest,
    BluetoothGATTGetServicesResponse,
    BluetoothGATTGetServicesDoneResponse,
    BluetoothGATTReadRequest,
    BluetoothGATTReadResponse,
    BluetoothGATTWriteRequest,
    BluetoothGATTReadDescriptorRequest,
    BluetoothGATTWriteDescriptorRequest,
    BluetoothGATTNotifyRequest,
    BluetoothGATTNotifyDataResponse,
    BluetoothGATTErrorResponse,
    BluetoothGATTWriteResponse,
    BluetoothGATTNotifyResponse,
    BluetoothDevicePairingResponse,
    BluetoothDeviceUnpairingResponse,
    UnsubscribeBluetoothLEAdvertisementsRequest,
    SubscribeVoiceAssistantRequest,
    VoiceAssistantRequest,
    VoiceAssistantResponse,
    VoiceAssistantEventResponse,
    BluetoothLERawAdvertisementsResponse,
    VoiceAssistantAudio,
}

impl Message {
    /// Decode a frame body into a message.
    ///
    /// Fails with [`ProtocolError::UnknownMessageType`] when the identifier is
    /// not in the catalog and with [`ProtocolError::MalformedMessage`] when it
    /// is but the body does not parse.
    pub fn decode(type_id: u32, payload: &[u8]) -> Result<Message> {
        let message_type =
            MessageType::from_id(type_id).ok_or(ProtocolError::UnknownMessageType(type_id))?;

        Self::decode_typed(message_type, payload).map_err(|e| ProtocolError::MalformedMessage {
            type_id,
            name: message_type.name(),
            reason: e.to_string(),
        })
    }

    /// Decode a raw frame into a message.
    pub fn from_frame(frame: &RawFrame) -> Result<Message> {
        Self::decode(frame.type_id, &frame.payload)
    }

    /// Encode this message into a raw frame.
    pub fn to_frame(&self) -> RawFrame {
        RawFrame::new(self.message_type().id(), self.encode_body())
    }

    /// Build a command for an entity kind from an already-encoded body.
    ///
    /// Returns `None` for kinds that accept no commands.
    pub fn entity_command(kind: EntityKind, payload: Vec<u8>) -> Option<Message> {
        kind.command_type().map(|message_type| Message::EntityCommand {
            message_type,
            kind,
            payload,
        })
    }

    fn decode_entity(
        message_type: MessageType,
        payload: &[u8],
    ) -> std::result::Result<Message, prost::DecodeError> {
        if let Some(kind) = EntityKind::from_list_type(message_type) {
            return Ok(Message::ListEntities {
                kind,
                info: EntityInfo::decode(payload)?,
            });
        }
        if let Some(kind) = EntityKind::from_state_type(message_type) {
            return Ok(Message::EntityState {
                message_type,
                kind,
                state: EntityState::decode(payload)?,
            });
        }
        if let Some(kind) = EntityKind::from_command_type(message_type) {
            return Ok(Message::EntityCommand {
                message_type,
                kind,
                payload: payload.to_vec(),
            });
        }
        Ok(Message::Other {
            message_type,
            payload: payload.to_vec(),
        })
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Device log verbosity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LogLevel {
    None = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Config = 4,
    Debug = 5,
    Verbose = 6,
    VeryVerbose = 7,
}

/// Operation requested by a [`BluetoothDeviceRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum BluetoothDeviceRequestType {
    Connect = 0,
    Disconnect = 1,
    Pair = 2,
    Unpair = 3,
    ConnectV3WithCache = 4,
    ConnectV3WithoutCache = 5,
    ClearCache = 6,
}

/// Voice assistant pipeline event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum VoiceAssistantEvent {
    Error = 0,
    RunStart = 1,
    RunEnd = 2,
    SttStart = 3,
    SttEnd = 4,
    IntentStart = 5,
    IntentEnd = 6,
    TtsStart = 7,
    TtsEnd = 8,
    WakeWordStart = 9,
    WakeWordEnd = 10,
    SttVadStart = 11,
    SttVadEnd = 12,
    TtsStreamStart = 98,
    TtsStreamEnd = 99,
}

/// Flag requesting voice audio over the API connection instead of UDP.
pub const VOICE_ASSISTANT_SUBSCRIBE_API_AUDIO: u32 = 1;

/// Flag requesting raw BLE advertisements.
pub const BLUETOOTH_ADVERTISEMENTS_RAW: u32 = 1;

// ============================================================================
// Connection Messages
// ============================================================================

/// Opens the exchange and negotiates the API version.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub client_info: String,
    #[prost(uint32, tag = "2")]
    pub api_version_major: u32,
    #[prost(uint32, tag = "3")]
    pub api_version_minor: u32,
}

impl HelloRequest {
    /// Hello advertising the API version this crate speaks.
    pub fn new(client_info: impl Into<String>) -> Self {
        Self {
            client_info: client_info.into(),
            api_version_major: API_VERSION_MAJOR,
            api_version_minor: API_VERSION_MINOR,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloResponse {
    #[prost(uint32, tag = "1")]
    pub api_version_major: u32,
    #[prost(uint32, tag = "2")]
    pub api_version_minor: u32,
    #[prost(string, tag = "3")]
    pub server_info: String,
    #[prost(string, tag = "4")]
    pub name: String,
}

/// Credential exchange.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectRequest {
    #[prost(string, tag = "1")]
    pub password: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectResponse {
    #[prost(bool, tag = "1")]
    pub invalid_password: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DisconnectRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DisconnectResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceInfoRequest {}

/// Static description of the remote device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceInfoResponse {
    #[prost(bool, tag = "1")]
    pub uses_password: bool,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub mac_address: String,
    #[prost(string, tag = "4")]
    pub esphome_version: String,
    #[prost(string, tag = "5")]
    pub compilation_time: String,
    #[prost(string, tag = "6")]
    pub model: String,
    #[prost(bool, tag = "7")]
    pub has_deep_sleep: bool,
    #[prost(string, tag = "8")]
    pub project_name: String,
    #[prost(string, tag = "9")]
    pub project_version: String,
    #[prost(uint32, tag = "10")]
    pub webserver_port: u32,
    #[prost(uint32, tag = "11")]
    pub legacy_bluetooth_proxy_version: u32,
    #[prost(string, tag = "12")]
    pub manufacturer: String,
    #[prost(string, tag = "13")]
    pub friendly_name: String,
    #[prost(uint32, tag = "14")]
    pub legacy_voice_assistant_version: u32,
    #[prost(uint32, tag = "15")]
    pub bluetooth_proxy_feature_flags: u32,
    #[prost(string, tag = "16")]
    pub suggested_area: String,
    #[prost(uint32, tag = "17")]
    pub voice_assistant_feature_flags: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetTimeRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetTimeResponse {
    #[prost(fixed32, tag = "1")]
    pub epoch_seconds: u32,
}

// ============================================================================
// Subscription Messages
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListEntitiesRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListEntitiesDoneResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeStatesRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeLogsRequest {
    #[prost(enumeration = "LogLevel", tag = "1")]
    pub level: i32,
    #[prost(bool, tag = "2")]
    pub dump_config: bool,
}

/// One device log line.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeLogsResponse {
    #[prost(enumeration = "LogLevel", tag = "1")]
    pub level: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub message: Vec<u8>,
    #[prost(bool, tag = "4")]
    pub send_failed: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeHomeassistantServicesRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeHomeAssistantStatesRequest {}

// ============================================================================
// Camera Messages
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct CameraImageRequest {
    #[prost(bool, tag = "1")]
    pub single: bool,
    #[prost(bool, tag = "2")]
    pub stream: bool,
}

/// One chunk of a camera image.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CameraImageResponse {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub done: bool,
}

// ============================================================================
// Bluetooth Messages
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeBluetoothLEAdvertisementsRequest {
    #[prost(uint32, tag = "1")]
    pub flags: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UnsubscribeBluetoothLEAdvertisementsRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothServiceData {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(uint32, repeated, tag = "2")]
    pub legacy_data: Vec<u32>,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

/// A parsed BLE advertisement relayed by the device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothLEAdvertisementResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub name: Vec<u8>,
    #[prost(sint32, tag = "3")]
    pub rssi: i32,
    #[prost(string, repeated, tag = "4")]
    pub service_uuids: Vec<String>,
    #[prost(message, repeated, tag = "5")]
    pub service_data: Vec<BluetoothServiceData>,
    #[prost(message, repeated, tag = "6")]
    pub manufacturer_data: Vec<BluetoothServiceData>,
    #[prost(uint32, tag = "7")]
    pub address_type: u32,
}

/// An unparsed BLE advertisement.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothLERawAdvertisement {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(sint32, tag = "2")]
    pub rssi: i32,
    #[prost(uint32, tag = "3")]
    pub address_type: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
}

/// A batch of raw advertisements (API 1.9 and later).
#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothLERawAdvertisementsResponse {
    #[prost(message, repeated, tag = "1")]
    pub advertisements: Vec<BluetoothLERawAdvertisement>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothDeviceRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(enumeration = "BluetoothDeviceRequestType", tag = "2")]
    pub request_type: i32,
    #[prost(bool, tag = "3")]
    pub has_address_type: bool,
    #[prost(uint32, tag = "4")]
    pub address_type: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothDeviceConnectionResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(bool, tag = "2")]
    pub connected: bool,
    #[prost(uint32, tag = "3")]
    pub mtu: u32,
    #[prost(int32, tag = "4")]
    pub error: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothDevicePairingResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(bool, tag = "2")]
    pub paired: bool,
    #[prost(int32, tag = "3")]
    pub error: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothDeviceUnpairingResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(int32, tag = "3")]
    pub error: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTGetServicesRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTDescriptor {
    #[prost(uint64, repeated, tag = "1")]
    pub uuid: Vec<u64>,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTCharacteristic {
    #[prost(uint64, repeated, tag = "1")]
    pub uuid: Vec<u64>,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(uint32, tag = "3")]
    pub properties: u32,
    #[prost(message, repeated, tag = "4")]
    pub descriptors: Vec<BluetoothGATTDescriptor>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTService {
    #[prost(uint64, repeated, tag = "1")]
    pub uuid: Vec<u64>,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(message, repeated, tag = "3")]
    pub characteristics: Vec<BluetoothGATTCharacteristic>,
}

/// One batch of discovered GATT services.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTGetServicesResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(message, repeated, tag = "2")]
    pub services: Vec<BluetoothGATTService>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTGetServicesDoneResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTReadRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTReadResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTWriteRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(bool, tag = "3")]
    pub response: bool,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTReadDescriptorRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTWriteDescriptorRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTNotifyRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(bool, tag = "3")]
    pub enable: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTNotifyDataResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTErrorResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(int32, tag = "3")]
    pub error: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTWriteResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BluetoothGATTNotifyResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
}

// ============================================================================
// Voice Assistant Messages
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeVoiceAssistantRequest {
    #[prost(bool, tag = "1")]
    pub subscribe: bool,
    #[prost(uint32, tag = "2")]
    pub flags: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoiceAssistantAudioSettings {
    #[prost(uint32, tag = "1")]
    pub noise_suppression_level: u32,
    #[prost(uint32, tag = "2")]
    pub auto_gain: u32,
    #[prost(float, tag = "3")]
    pub volume_multiplier: f32,
}

/// The device asks the client to start or stop a voice pipeline run.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VoiceAssistantRequest {
    #[prost(bool, tag = "1")]
    pub start: bool,
    #[prost(string, tag = "2")]
    pub conversation_id: String,
    #[prost(uint32, tag = "3")]
    pub flags: u32,
    #[prost(message, optional, tag = "4")]
    pub audio_settings: Option<VoiceAssistantAudioSettings>,
    #[prost(string, tag = "5")]
    pub wake_word_phrase: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoiceAssistantResponse {
    #[prost(uint32, tag = "1")]
    pub port: u32,
    #[prost(bool, tag = "2")]
    pub error: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoiceAssistantEventData {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoiceAssistantEventResponse {
    #[prost(enumeration = "VoiceAssistantEvent", tag = "1")]
    pub event_type: i32,
    #[prost(message, repeated, tag = "2")]
    pub data: Vec<VoiceAssistantEventData>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoiceAssistantAudio {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub end: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_ids_are_unique() {
        let mut ids: Vec<u32> = MessageType::ALL.iter().map(|t| t.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), MessageType::ALL.len());
    }

    #[test]
    fn test_message_type_lookup() {
        for message_type in MessageType::ALL {
            assert_eq!(MessageType::from_id(message_type.id()), Some(*message_type));
        }
        assert_eq!(MessageType::from_id(0), None);
        assert_eq!(MessageType::from_id(4000), None);
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(MessageType::HelloRequest.name(), "HelloRequest");
        assert_eq!(
            MessageType::BluetoothGATTGetServicesDoneResponse.name(),
            "BluetoothGATTGetServicesDoneResponse"
        );
        assert_eq!(MessageType::PingResponse.to_string(), "PingResponse");
    }

    #[test]
    fn test_hello_request_advertises_api_version() {
        let hello = HelloRequest::new("espapi-test");
        assert_eq!(hello.api_version_major, 1);
        assert_eq!(hello.api_version_minor, 10);
    }

    #[test]
    fn test_decode_hello_response() {
        let body = HelloResponse {
            api_version_major: 1,
            api_version_minor: 9,
            server_info: "kitchen (esphome v2024.6.0)".to_string(),
            name: "kitchen".to_string(),
        }
        .encode_to_vec();

        let message = Message::decode(2, &body).unwrap();
        assert_eq!(message.message_type(), MessageType::HelloResponse);
        let hello = HelloResponse::try_from(message).unwrap();
        assert_eq!(hello.name, "kitchen");
        assert_eq!(hello.api_version_minor, 9);
    }

    #[test]
    fn test_to_frame_uses_catalog_id() {
        let frame = Message::from(ConnectRequest {
            password: "secret".to_string(),
        })
        .to_frame();
        assert_eq!(frame.type_id, 3);

        let decoded = Message::from_frame(&frame).unwrap();
        assert_eq!(
            decoded,
            Message::ConnectRequest(ConnectRequest {
                password: "secret".to_string()
            })
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = Message::decode(4242, &[]).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownMessageType(4242));
        assert!(!err.is_fatal_decode());
    }

    #[test]
    fn test_decode_malformed_known_type() {
        // Field 1 declared as length-delimited with a length running past the end.
        let err = Message::decode(2, &[0x0a, 0x05, 0x01]).unwrap_err();
        match &err {
            ProtocolError::MalformedMessage { type_id, name, .. } => {
                assert_eq!(*type_id, 2);
                assert_eq!(*name, "HelloResponse");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_fatal_decode());
    }

    #[test]
    fn test_try_from_wrong_variant_returns_message() {
        let message = Message::from(PingRequest {});
        let back = PingResponse::try_from(message.clone()).unwrap_err();
        assert_eq!(back, message);
    }

    #[test]
    fn test_unmodelled_type_decodes_as_other() {
        let message = Message::decode(35, &[0x0a, 0x01, b'x']).unwrap();
        assert_eq!(
            message,
            Message::Other {
                message_type: MessageType::HomeassistantServiceResponse,
                payload: vec![0x0a, 0x01, b'x'],
            }
        );
        assert_eq!(message.to_frame().payload, vec![0x0a, 0x01, b'x']);
    }

    #[test]
    fn test_entity_command_builder() {
        let message = Message::entity_command(EntityKind::Switch, vec![0x0d, 1, 0, 0, 0]).unwrap();
        assert_eq!(message.message_type(), MessageType::SwitchCommandRequest);
        assert_eq!(message.to_frame().type_id, 33);

        assert!(Message::entity_command(EntityKind::Sensor, Vec::new()).is_none());
    }

    #[test]
    fn test_typed_message_constants() {
        assert_eq!(HelloResponse::MESSAGE_TYPE, MessageType::HelloResponse);
        assert_eq!(
            BluetoothDeviceConnectionResponse::MESSAGE_TYPE,
            MessageType::BluetoothDeviceConnectionResponse
        );
    }
}
