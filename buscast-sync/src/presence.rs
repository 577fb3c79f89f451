//! Presence derived from store snapshots.
//!
//! ```text
//! SyncStore snapshot
//!       │
//!       ▼
//! PresenceView::derive(snapshot, self_id)
//!       │
//!       ├──► self_broadcasting ──► SessionController
//!       └──► renderable()      ──► PositionInterpolator (per-marker target)
//! ```
//!
//! Every broadcaster in the snapshot is active. The coordinate validity
//! filter only decides what can be drawn; it never changes the active count.

use crate::geo::{fit_viewport, LatLng, Viewport};
use crate::protocol::{
    Snapshot, StoredRecord, FIELD_BUS_NO, FIELD_DRIVER_NAME, FIELD_IS_SIMULATED, FIELD_LATITUDE,
    FIELD_LONGITUDE, FIELD_TIMESTAMP,
};

/// Display fallback for a record without a bus number.
pub const FALLBACK_BUS_NO: &str = "Unknown";

/// Display fallback for a record without a driver name.
pub const FALLBACK_DRIVER_NAME: &str = "Driver";

// ───────────────────────────────────────────────────────────────────
// Active broadcaster
// ───────────────────────────────────────────────────────────────────

/// One record of the active set, with display fallbacks applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveBroadcaster {
    pub id: String,
    pub bus_no: String,
    pub driver_name: String,
    /// `None` when either coordinate is missing or not a number.
    pub position: Option<LatLng>,
    pub is_simulated: bool,
    /// Server timestamp (ms) of the last write.
    pub timestamp: Option<u64>,
}

impl ActiveBroadcaster {
    pub fn from_record(record: &StoredRecord) -> Self {
        let text = |key: &str, fallback: &str| {
            record
                .get_str(key)
                .filter(|s| !s.is_empty())
                .unwrap_or(fallback)
                .to_string()
        };
        let position = match (record.get_f64(FIELD_LATITUDE), record.get_f64(FIELD_LONGITUDE)) {
            (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)),
            _ => None,
        };
        Self {
            id: record.id.clone(),
            bus_no: text(FIELD_BUS_NO, FALLBACK_BUS_NO),
            driver_name: text(FIELD_DRIVER_NAME, FALLBACK_DRIVER_NAME),
            position,
            is_simulated: record.get_bool(FIELD_IS_SIMULATED).unwrap_or(false),
            timestamp: record.get_u64(FIELD_TIMESTAMP),
        }
    }

    /// Renderable position, if any.
    pub fn valid_position(&self) -> Option<LatLng> {
        self.position.filter(LatLng::is_valid)
    }

    pub fn has_valid_position(&self) -> bool {
        self.valid_position().is_some()
    }

    /// Marker popup title, e.g. `Bus 101A - T (Simulated)`.
    pub fn popup_label(&self) -> String {
        let mut label = format!("Bus {} - {}", self.bus_no, self.driver_name);
        if self.is_simulated {
            label.push_str(" (Simulated)");
        }
        label
    }

    pub fn coords_label(&self) -> String {
        match self.valid_position() {
            Some(p) => format!("Coords: {:.5}, {:.5}", p.lat, p.lng),
            None => "No coordinates".to_string(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// View
// ───────────────────────────────────────────────────────────────────

/// Everything a client derives from one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceView {
    self_broadcasting: bool,
    broadcasters: Vec<ActiveBroadcaster>,
}

impl PresenceView {
    /// Pure function of the snapshot and our identity.
    pub fn derive(snapshot: &Snapshot, self_id: Option<&str>) -> Self {
        Self {
            self_broadcasting: self_id.is_some_and(|id| snapshot.contains(id)),
            broadcasters: snapshot
                .records
                .iter()
                .map(ActiveBroadcaster::from_record)
                .collect(),
        }
    }

    pub fn self_broadcasting(&self) -> bool {
        self.self_broadcasting
    }

    /// All active broadcasters, renderable or not.
    pub fn broadcasters(&self) -> &[ActiveBroadcaster] {
        &self.broadcasters
    }

    pub fn active_count(&self) -> usize {
        self.broadcasters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.broadcasters.is_empty()
    }

    /// Broadcasters with a drawable position.
    pub fn renderable(&self) -> impl Iterator<Item = (&ActiveBroadcaster, LatLng)> {
        self.broadcasters
            .iter()
            .filter_map(|b| b.valid_position().map(|p| (b, p)))
    }

    pub fn get(&self, id: &str) -> Option<&ActiveBroadcaster> {
        self.broadcasters.iter().find(|b| b.id == id)
    }

    /// Viewport fitting every renderable marker; `None` keeps the current view.
    pub fn viewport(&self) -> Option<Viewport> {
        let positions: Vec<LatLng> = self.renderable().map(|(_, p)| p).collect();
        fit_viewport(&positions, self.active_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{DEFAULT_COORDINATES, DEFAULT_ZOOM, FIT_PADDING_PX};
    use crate::protocol::Fields;
    use serde_json::{json, Value};

    fn record(id: &str, value: Value) -> StoredRecord {
        match value {
            Value::Object(map) => StoredRecord::new(id, map),
            _ => panic!("Expected object"),
        }
    }

    fn bus(id: &str, lat: f64, lng: f64) -> StoredRecord {
        record(
            id,
            json!({
                "busNo": id.to_uppercase(),
                "driverName": "D",
                "latitude": lat,
                "longitude": lng,
                "isSimulated": false,
                "timestamp": 1000,
            }),
        )
    }

    // ── ActiveBroadcaster tests ──────────────────────────────────

    #[test]
    fn test_from_record_full() {
        let b = ActiveBroadcaster::from_record(&record(
            "U1",
            json!({
                "busNo": "101A",
                "driverName": "T",
                "latitude": 17.4,
                "longitude": 78.5,
                "isSimulated": true,
                "timestamp": 42,
            }),
        ));
        assert_eq!(b.bus_no, "101A");
        assert_eq!(b.driver_name, "T");
        assert_eq!(b.position, Some(LatLng::new(17.4, 78.5)));
        assert!(b.is_simulated);
        assert_eq!(b.timestamp, Some(42));
        assert_eq!(b.popup_label(), "Bus 101A - T (Simulated)");
        assert_eq!(b.coords_label(), "Coords: 17.40000, 78.50000");
    }

    #[test]
    fn test_from_record_fallbacks() {
        let b = ActiveBroadcaster::from_record(&record("U2", json!({"busNo": ""})));
        assert_eq!(b.bus_no, FALLBACK_BUS_NO);
        assert_eq!(b.driver_name, FALLBACK_DRIVER_NAME);
        assert_eq!(b.position, None);
        assert!(!b.is_simulated);
        assert_eq!(b.popup_label(), "Bus Unknown - Driver");
        assert_eq!(b.coords_label(), "No coordinates");
    }

    #[test]
    fn test_out_of_range_position_not_renderable() {
        let b = ActiveBroadcaster::from_record(&bus("u3", 95.0, 10.0));
        assert!(b.position.is_some());
        assert!(!b.has_valid_position());

        let text = ActiveBroadcaster::from_record(&record(
            "u4",
            json!({"latitude": "17.4", "longitude": 78.5}),
        ));
        assert!(text.position.is_none());
    }

    // ── PresenceView tests ───────────────────────────────────────

    #[test]
    fn test_self_broadcasting() {
        let snapshot = Snapshot::new(vec![bus("u1", 1.0, 1.0), bus("u2", 2.0, 2.0)]);
        assert!(PresenceView::derive(&snapshot, Some("u1")).self_broadcasting());
        assert!(!PresenceView::derive(&snapshot, Some("u9")).self_broadcasting());
        assert!(!PresenceView::derive(&snapshot, None).self_broadcasting());
    }

    #[test]
    fn test_invalid_positions_count_but_do_not_render() {
        let snapshot = Snapshot::new(vec![
            bus("u1", 1.0, 1.0),
            bus("u2", 91.0, 1.0),
            StoredRecord::new("u3", Fields::new()),
        ]);
        let view = PresenceView::derive(&snapshot, None);
        assert_eq!(view.active_count(), 3);
        let renderable: Vec<_> = view.renderable().map(|(b, _)| b.id.as_str()).collect();
        assert_eq!(renderable, vec!["u1"]);
        assert_eq!(view.get("u3").unwrap().bus_no, FALLBACK_BUS_NO);
    }

    #[test]
    fn test_viewport_default_when_empty() {
        let view = PresenceView::derive(&Snapshot::default(), Some("u1"));
        assert!(view.is_empty());
        assert_eq!(
            view.viewport(),
            Some(Viewport::Center {
                center: DEFAULT_COORDINATES,
                zoom: DEFAULT_ZOOM
            })
        );
    }

    #[test]
    fn test_viewport_fits_renderable() {
        let snapshot = Snapshot::new(vec![bus("u1", 1.0, 2.0), bus("u2", 3.0, 4.0), bus("u3", 99.0, 0.0)]);
        match PresenceView::derive(&snapshot, None).viewport() {
            Some(Viewport::Fit { bounds, padding_px }) => {
                assert_eq!(padding_px, FIT_PADDING_PX);
                assert_eq!(bounds.south_west, LatLng::new(1.0, 2.0));
                assert_eq!(bounds.north_east, LatLng::new(3.0, 4.0));
            }
            other => panic!("Expected fit viewport, got {other:?}"),
        }
    }

    #[test]
    fn test_viewport_kept_when_nothing_renderable() {
        let snapshot = Snapshot::new(vec![bus("u1", f64::NAN, 2.0)]);
        assert_eq!(PresenceView::derive(&snapshot, None).viewport(), None);
    }
}
