//! Entity component kinds and the record headers shared by all of them.

use prost::Message as ProstMessage;

use crate::messages::MessageType;

/// Component kinds collected by an entity listing.
///
/// List-entities responses of any other kind are delivered as
/// [`crate::Message::Other`] and never enter an entity listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    BinarySensor,
    Cover,
    Fan,
    Light,
    Sensor,
    Switch,
    TextSensor,
    Camera,
    Climate,
    Number,
    Select,
    Siren,
    Lock,
    Button,
    MediaPlayer,
    Text,
}

impl EntityKind {
    /// Every kind, in the order the catalog lists them.
    pub const ALL: [EntityKind; 16] = [
        EntityKind::BinarySensor,
        EntityKind::Cover,
        EntityKind::Fan,
        EntityKind::Light,
        EntityKind::Sensor,
        EntityKind::Switch,
        EntityKind::TextSensor,
        EntityKind::Camera,
        EntityKind::Climate,
        EntityKind::Number,
        EntityKind::Select,
        EntityKind::Siren,
        EntityKind::Lock,
        EntityKind::Button,
        EntityKind::MediaPlayer,
        EntityKind::Text,
    ];

    /// List-entities response type for this kind.
    pub fn list_type(self) -> MessageType {
        match self {
            EntityKind::BinarySensor => MessageType::ListEntitiesBinarySensorResponse,
            EntityKind::Cover => MessageType::ListEntitiesCoverResponse,
            EntityKind::Fan => MessageType::ListEntitiesFanResponse,
            EntityKind::Light => MessageType::ListEntitiesLightResponse,
            EntityKind::Sensor => MessageType::ListEntitiesSensorResponse,
            EntityKind::Switch => MessageType::ListEntitiesSwitchResponse,
            EntityKind::TextSensor => MessageType::ListEntitiesTextSensorResponse,
            EntityKind::Camera => MessageType::ListEntitiesCameraResponse,
            EntityKind::Climate => MessageType::ListEntitiesClimateResponse,
            EntityKind::Number => MessageType::ListEntitiesNumberResponse,
            EntityKind::Select => MessageType::ListEntitiesSelectResponse,
            EntityKind::Siren => MessageType::ListEntitiesSirenResponse,
            EntityKind::Lock => MessageType::ListEntitiesLockResponse,
            EntityKind::Button => MessageType::ListEntitiesButtonResponse,
            EntityKind::MediaPlayer => MessageType::ListEntitiesMediaPlayerResponse,
            EntityKind::Text => MessageType::ListEntitiesTextResponse,
        }
    }

    /// State response type, if the kind reports state.
    pub fn state_type(self) -> Option<MessageType> {
        match self {
            EntityKind::BinarySensor => Some(MessageType::BinarySensorStateResponse),
            EntityKind::Cover => Some(MessageType::CoverStateResponse),
            EntityKind::Fan => Some(MessageType::FanStateResponse),
            EntityKind::Light => Some(MessageType::LightStateResponse),
            EntityKind::Sensor => Some(MessageType::SensorStateResponse),
            EntityKind::Switch => Some(MessageType::SwitchStateResponse),
            EntityKind::TextSensor => Some(MessageType::TextSensorStateResponse),
            EntityKind::Climate => Some(MessageType::ClimateStateResponse),
            EntityKind::Number => Some(MessageType::NumberStateResponse),
            EntityKind::Select => Some(MessageType::SelectStateResponse),
            EntityKind::Siren => Some(MessageType::SirenStateResponse),
            EntityKind::Lock => Some(MessageType::LockStateResponse),
            EntityKind::MediaPlayer => Some(MessageType::MediaPlayerStateResponse),
            EntityKind::Text => Some(MessageType::TextStateResponse),
            EntityKind::Camera | EntityKind::Button => None,
        }
    }

    /// Command request type, if the kind accepts commands.
    pub fn command_type(self) -> Option<MessageType> {
        match self {
            EntityKind::Cover => Some(MessageType::CoverCommandRequest),
            EntityKind::Fan => Some(MessageType::FanCommandRequest),
            EntityKind::Light => Some(MessageType::LightCommandRequest),
            EntityKind::Switch => Some(MessageType::SwitchCommandRequest),
            EntityKind::Camera => Some(MessageType::CameraImageRequest),
            EntityKind::Climate => Some(MessageType::ClimateCommandRequest),
            EntityKind::Number => Some(MessageType::NumberCommandRequest),
            EntityKind::Select => Some(MessageType::SelectCommandRequest),
            EntityKind::Siren => Some(MessageType::SirenCommandRequest),
            EntityKind::Lock => Some(MessageType::LockCommandRequest),
            EntityKind::Button => Some(MessageType::ButtonCommandRequest),
            EntityKind::MediaPlayer => Some(MessageType::MediaPlayerCommandRequest),
            EntityKind::Text => Some(MessageType::TextCommandRequest),
            EntityKind::BinarySensor | EntityKind::Sensor | EntityKind::TextSensor => None,
        }
    }

    /// Component label, derived from the list response name.
    ///
    /// `ListEntitiesBinarySensorResponse` yields `BinarySensor`.
    pub fn label(self) -> &'static str {
        let name = self.list_type().name();
        name.strip_prefix("ListEntities")
            .and_then(|rest| rest.strip_suffix("Response"))
            .unwrap_or(name)
    }

    /// Kind whose list-entities response has this type.
    pub fn from_list_type(message_type: MessageType) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.list_type() == message_type)
    }

    /// Kind whose state response has this type.
    pub fn from_state_type(message_type: MessageType) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.state_type() == Some(message_type))
    }

    /// Kind whose command request has this type.
    ///
    /// Camera image requests are modelled on their own and never map back.
    pub fn from_command_type(message_type: MessageType) -> Option<Self> {
        if message_type == MessageType::CameraImageRequest {
            return None;
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.command_type() == Some(message_type))
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, PartialEq, prost::Message)]
struct EntityHeader {
    #[prost(string, tag = "1")]
    object_id: String,
    #[prost(fixed32, tag = "2")]
    key: u32,
    #[prost(string, tag = "3")]
    name: String,
    #[prost(string, tag = "4")]
    unique_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct StateHeader {
    #[prost(fixed32, tag = "1")]
    key: u32,
}

/// Common header of a list-entities record.
///
/// Kind-specific fields stay in `raw`; unknown fields are skipped when the
/// header is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub object_id: String,
    pub key: u32,
    pub name: String,
    pub unique_id: String,
    /// Full protobuf body of the record.
    pub raw: Vec<u8>,
}

impl EntityInfo {
    pub(crate) fn decode(payload: &[u8]) -> Result<Self, prost::DecodeError> {
        let header = EntityHeader::decode(payload)?;
        Ok(Self {
            object_id: header.object_id,
            key: header.key,
            name: header.name,
            unique_id: header.unique_id,
            raw: payload.to_vec(),
        })
    }

    /// Encode a bare record carrying only the common header.
    pub fn with_header(
        object_id: impl Into<String>,
        key: u32,
        name: impl Into<String>,
        unique_id: impl Into<String>,
    ) -> Self {
        let header = EntityHeader {
            object_id: object_id.into(),
            key,
            name: name.into(),
            unique_id: unique_id.into(),
        };
        let raw = header.encode_to_vec();
        Self {
            object_id: header.object_id,
            key: header.key,
            name: header.name,
            unique_id: header.unique_id,
            raw,
        }
    }
}

/// Key of an entity state update plus its full body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityState {
    pub key: u32,
    pub raw: Vec<u8>,
}

impl EntityState {
    pub(crate) fn decode(payload: &[u8]) -> Result<Self, prost::DecodeError> {
        let header = StateHeader::decode(payload)?;
        Ok(Self {
            key: header.key,
            raw: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;

    #[test]
    fn test_labels() {
        assert_eq!(EntityKind::BinarySensor.label(), "BinarySensor");
        assert_eq!(EntityKind::MediaPlayer.label(), "MediaPlayer");
        assert_eq!(EntityKind::Text.label(), "Text");
        assert_eq!(EntityKind::Light.to_string(), "Light");
    }

    #[test]
    fn test_list_type_lookup_covers_all_kinds() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_list_type(kind.list_type()), Some(kind));
        }
    }

    #[test]
    fn test_kinds_outside_listing_are_not_entities() {
        assert_eq!(
            EntityKind::from_list_type(MessageType::ListEntitiesAlarmControlPanelResponse),
            None
        );
        assert_eq!(
            EntityKind::from_list_type(MessageType::ListEntitiesServicesResponse),
            None
        );
        assert_eq!(
            EntityKind::from_list_type(MessageType::ListEntitiesDoneResponse),
            None
        );
    }

    #[test]
    fn test_decode_list_record_keeps_raw_body() {
        let info = EntityInfo::with_header("kitchen_light", 0xdead_beef, "Kitchen Light", "abc");
        // Append an unknown kind-specific field (tag 9, varint 1).
        let mut body = info.raw.clone();
        body.extend_from_slice(&[0x48, 0x01]);

        let message = Message::decode(15, &body).unwrap();
        match message {
            Message::ListEntities { kind, info } => {
                assert_eq!(kind, EntityKind::Light);
                assert_eq!(info.object_id, "kitchen_light");
                assert_eq!(info.key, 0xdead_beef);
                assert_eq!(info.name, "Kitchen Light");
                assert_eq!(info.raw, body);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_state_update() {
        // fixed32 key = 7, then bool state = true at tag 2.
        let body = vec![0x0d, 0x07, 0x00, 0x00, 0x00, 0x10, 0x01];
        let message = Message::decode(26, &body).unwrap();
        match message {
            Message::EntityState {
                message_type,
                kind,
                state,
            } => {
                assert_eq!(message_type, MessageType::SwitchStateResponse);
                assert_eq!(kind, EntityKind::Switch);
                assert_eq!(state.key, 7);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
