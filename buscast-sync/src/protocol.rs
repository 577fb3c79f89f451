//! Record model and relay wire protocol.
//!
//! A broadcast record is a plain key/value map stored under the
//! broadcaster's identity in the `locations` collection:
//!
//! ```text
//! locations/<identity> = {
//!     busNo, driverName, simulateMovement,   (profile, written once)
//!     latitude, longitude,                   (every accepted sample)
//!     isSimulated,                           (written once)
//!     timestamp                              (stamped by the store)
//! }
//! ```
//!
//! Relay wire format (bincode-encoded envelope, JSON payload):
//! ```text
//! ┌──────────┬────────────┬──────────┬───────┬──────────────┐
//! │ msg_type │ collection │ id       │ merge │ payload      │
//! │ 1 byte   │ string     │ string   │ bool  │ JSON bytes   │
//! └──────────┴────────────┴──────────┴───────┴──────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ProtocolError, SessionError};
use crate::geo::LatLng;

/// Collection holding one record per active broadcaster.
pub const LOCATIONS_COLLECTION: &str = "locations";

pub const FIELD_BUS_NO: &str = "busNo";
pub const FIELD_DRIVER_NAME: &str = "driverName";
pub const FIELD_SIMULATE: &str = "simulateMovement";
pub const FIELD_LATITUDE: &str = "latitude";
pub const FIELD_LONGITUDE: &str = "longitude";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_IS_SIMULATED: &str = "isSimulated";

/// Record contents as stored: a plain key/value map.
pub type Fields = Map<String, Value>;

// ───────────────────────────────────────────────────────────────────
// Profile
// ───────────────────────────────────────────────────────────────────

/// User-chosen broadcaster details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcasterProfile {
    pub bus_no: String,
    pub driver_name: String,
    #[serde(rename = "simulateMovement")]
    pub simulate: bool,
}

impl BroadcasterProfile {
    pub fn new(bus_no: impl Into<String>, driver_name: impl Into<String>, simulate: bool) -> Self {
        Self {
            bus_no: bus_no.into(),
            driver_name: driver_name.into(),
            simulate,
        }
    }

    /// Both bus number and driver name must be non-blank.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.bus_no.trim().is_empty() || self.driver_name.trim().is_empty() {
            return Err(SessionError::Validation(
                "Bus Number and Driver Name cannot be empty.".into(),
            ));
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Writes
// ───────────────────────────────────────────────────────────────────

/// A write issued by the session for its own record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    /// First accepted sample: the full record, replacing anything stored.
    Create {
        profile: BroadcasterProfile,
        position: LatLng,
    },
    /// Subsequent samples: position only, merged into the record.
    Position { position: LatLng },
}

impl RecordWrite {
    /// Whether the write merges into an existing record.
    pub fn merge(&self) -> bool {
        matches!(self, RecordWrite::Position { .. })
    }

    pub fn into_fields(self) -> Fields {
        let value = match self {
            RecordWrite::Create { profile, position } => json!({
                FIELD_BUS_NO: profile.bus_no,
                FIELD_DRIVER_NAME: profile.driver_name,
                FIELD_SIMULATE: profile.simulate,
                FIELD_LATITUDE: position.lat,
                FIELD_LONGITUDE: position.lng,
                FIELD_IS_SIMULATED: profile.simulate,
            }),
            RecordWrite::Position { position } => json!({
                FIELD_LATITUDE: position.lat,
                FIELD_LONGITUDE: position.lng,
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Stored records & snapshots
// ───────────────────────────────────────────────────────────────────

/// A record as held by the store, keyed by broadcaster identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub fields: Fields,
}

impl StoredRecord {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }
}

/// Point-in-time view of every record in a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: Vec<StoredRecord>,
}

impl Snapshot {
    pub fn new(records: Vec<StoredRecord>) -> Self {
        Self { records }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&StoredRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay wire protocol
// ───────────────────────────────────────────────────────────────────

/// Message types understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client → server: start receiving snapshots of a collection
    Subscribe = 1,
    /// Server → client: full collection snapshot
    Snapshot = 2,
    /// Client → server: upsert a record
    Put = 3,
    /// Client → server: remove a record
    Delete = 4,
    /// Server → client: request rejected
    Error = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Top-level relay message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub msg_type: MessageType,
    pub collection: String,
    pub id: String,
    pub merge: bool,
    /// JSON payload (fields, snapshot, or error text)
    pub payload: Vec<u8>,
}

impl RelayMessage {
    fn bare(msg_type: MessageType, collection: &str, id: &str) -> Self {
        Self {
            msg_type,
            collection: collection.to_string(),
            id: id.to_string(),
            merge: false,
            payload: Vec::new(),
        }
    }

    pub fn subscribe(collection: &str) -> Self {
        Self::bare(MessageType::Subscribe, collection, "")
    }

    pub fn snapshot(collection: &str, snapshot: &Snapshot) -> Result<Self, ProtocolError> {
        let mut msg = Self::bare(MessageType::Snapshot, collection, "");
        msg.payload = to_json(snapshot)?;
        Ok(msg)
    }

    pub fn put(collection: &str, id: &str, fields: &Fields, merge: bool) -> Result<Self, ProtocolError> {
        let mut msg = Self::bare(MessageType::Put, collection, id);
        msg.merge = merge;
        msg.payload = to_json(fields)?;
        Ok(msg)
    }

    pub fn delete(collection: &str, id: &str) -> Self {
        Self::bare(MessageType::Delete, collection, id)
    }

    pub fn error(collection: &str, reason: &str) -> Self {
        let mut msg = Self::bare(MessageType::Error, collection, "");
        msg.payload = reason.as_bytes().to_vec();
        msg
    }

    pub fn ping() -> Self {
        Self::bare(MessageType::Ping, "", "")
    }

    pub fn pong() -> Self {
        Self::bare(MessageType::Pong, "", "")
    }

    /// Encode to binary (bincode).
    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode from binary.
    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Record fields carried by a `Put`.
    pub fn fields(&self) -> Result<Fields, ProtocolError> {
        if self.msg_type != MessageType::Put {
            return Err(ProtocolError::InvalidMessageType);
        }
        from_json(&self.payload)
    }

    /// Snapshot carried by a `Snapshot` message.
    pub fn snapshot_payload(&self) -> Result<Snapshot, ProtocolError> {
        if self.msg_type != MessageType::Snapshot {
            return Err(ProtocolError::InvalidMessageType);
        }
        from_json(&self.payload)
    }

    /// Reason carried by an `Error` message.
    pub fn error_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn from_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_validation() {
        assert!(BroadcasterProfile::new("101A", "T", false).validate().is_ok());
        assert!(matches!(
            BroadcasterProfile::new("", "X", false).validate(),
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            BroadcasterProfile::new("101A", "   ", true).validate(),
            Err(SessionError::Validation(_))
        ));
    }

    #[test]
    fn test_profile_serde_field_names() {
        let profile = BroadcasterProfile::new("7", "Ana", true);
        let value = serde_json::to_value(&profile).unwrap();
        assert_eq!(value[FIELD_BUS_NO], "7");
        assert_eq!(value[FIELD_DRIVER_NAME], "Ana");
        assert_eq!(value[FIELD_SIMULATE], true);
    }

    #[test]
    fn test_create_write_fields() {
        let write = RecordWrite::Create {
            profile: BroadcasterProfile::new("101A", "T", true),
            position: LatLng::new(17.4, 78.5),
        };
        assert!(!write.merge());

        let fields = write.into_fields();
        assert_eq!(fields[FIELD_BUS_NO], "101A");
        assert_eq!(fields[FIELD_DRIVER_NAME], "T");
        assert_eq!(fields[FIELD_IS_SIMULATED], true);
        assert_eq!(fields[FIELD_LATITUDE], 17.4);
        assert_eq!(fields[FIELD_LONGITUDE], 78.5);
        assert!(!fields.contains_key(FIELD_TIMESTAMP));
    }

    #[test]
    fn test_position_write_is_partial() {
        let write = RecordWrite::Position {
            position: LatLng::new(1.5, 2.5),
        };
        assert!(write.merge());

        let fields = write.into_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[FIELD_LATITUDE], 1.5);
        assert_eq!(fields[FIELD_LONGITUDE], 2.5);
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = Snapshot::new(vec![
            StoredRecord::new("U1", Fields::new()),
            StoredRecord::new("U2", Fields::new()),
        ]);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains("U1"));
        assert!(!snapshot.contains("U3"));
        assert_eq!(snapshot.get("U2").map(|r| r.id.as_str()), Some("U2"));
        assert!(Snapshot::default().is_empty());
    }

    #[test]
    fn test_stored_record_accessors() {
        let fields = RecordWrite::Create {
            profile: BroadcasterProfile::new("9", "Bo", false),
            position: LatLng::new(3.0, 4.0),
        }
        .into_fields();
        let record = StoredRecord::new("U9", fields);
        assert_eq!(record.get_str(FIELD_BUS_NO), Some("9"));
        assert_eq!(record.get_f64(FIELD_LATITUDE), Some(3.0));
        assert_eq!(record.get_bool(FIELD_IS_SIMULATED), Some(false));
        assert_eq!(record.get_str("missing"), None);
    }

    #[test]
    fn test_relay_put_carries_fields() {
        let fields = RecordWrite::Position {
            position: LatLng::new(1.0, 2.0),
        }
        .into_fields();
        let msg = RelayMessage::put(LOCATIONS_COLLECTION, "U1", &fields, true).unwrap();

        let decoded = RelayMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Put);
        assert_eq!(decoded.id, "U1");
        assert!(decoded.merge);
        assert_eq!(decoded.fields().unwrap(), fields);
    }

    #[test]
    fn test_relay_snapshot_payload() {
        let snapshot = Snapshot::new(vec![StoredRecord::new("U1", Fields::new())]);
        let msg = RelayMessage::snapshot(LOCATIONS_COLLECTION, &snapshot).unwrap();
        let decoded = RelayMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.snapshot_payload().unwrap(), snapshot);
    }

    #[test]
    fn test_relay_coordinates_are_bit_exact() {
        // Coordinates survive the JSON payload bit for bit.
        let positions = [
            LatLng::new(17.43065300129256, 78.53042705991402),
            LatLng::new(2.638344616030823e-256, -0.1),
            LatLng::new(6.92710000000001, 79.86120000000003),
        ];
        for position in positions {
            let fields = RecordWrite::Position { position }.into_fields();
            let msg = RelayMessage::put(LOCATIONS_COLLECTION, "U1", &fields, true).unwrap();
            let decoded = RelayMessage::decode(&msg.encode().unwrap()).unwrap();
            let record = StoredRecord::new("U1", decoded.fields().unwrap());
            assert_eq!(record.get_f64(FIELD_LATITUDE).map(f64::to_bits), Some(position.lat.to_bits()));
            assert_eq!(record.get_f64(FIELD_LONGITUDE).map(f64::to_bits), Some(position.lng.to_bits()));
        }
    }

    #[test]
    fn test_relay_wrong_payload_type() {
        let msg = RelayMessage::delete(LOCATIONS_COLLECTION, "U1");
        assert_eq!(msg.fields(), Err(ProtocolError::InvalidMessageType));
        assert_eq!(msg.snapshot_payload(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_relay_error_reason() {
        let msg = RelayMessage::error(LOCATIONS_COLLECTION, "bad payload");
        assert_eq!(msg.error_reason(), "bad payload");
    }

    #[test]
    fn test_relay_decode_garbage() {
        assert!(matches!(
            RelayMessage::decode(&[0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::Deserialization(_))
        ));
    }
}
