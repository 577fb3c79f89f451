//! # buscast-sync - Live bus position broadcasting
//!
//! A broadcaster publishes its position as a single record keyed by its
//! identity; every viewer renders all records with smooth marker motion.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  Throttle   ┌───────────────────┐  put / delete  ┌─────────────┐
//! │ LocationSource │ ──────────► │ SessionController │ ─────────────► │  SyncStore  │
//! │ (real / sim)   │  (500 ms)   │ Idle→Starting→    │                │ (memory or  │
//! └────────────────┘             │ Active→Stopping   │ ◄───────────── │  relay)     │
//!                                └───────────────────┘   snapshots    └──────┬──────┘
//!                                                                            │
//!                                ┌──────────────────────┐  PresenceView      │
//!                                │ PositionInterpolator │ ◄──────────────────┘
//!                                │ (per-marker, 600 ms) │
//!                                └──────────────────────┘
//! ```
//!
//! Record existence in the latest snapshot is the only definition of
//! "is broadcasting".
//!
//! ## Modules
//!
//! - [`session`]: Broadcast lifecycle state machine
//! - [`source`]: Real sensor watch and simulated random walk
//! - [`throttle`]: Minimum-interval write gate
//! - [`store`]: SyncStore contract and in-memory store
//! - [`presence`]: Active broadcasters derived from snapshots
//! - [`interpolate`]: Per-marker animation between positions
//! - [`runtime`]: tokio event loops for sessions and viewers
//! - [`relay`]: WebSocket relay server and store client
//! - [`protocol`]: Record fields and relay wire format

pub mod error;
pub mod geo;
pub mod identity;
pub mod interpolate;
pub mod prefs;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod session;
pub mod source;
pub mod store;
pub mod throttle;

// Re-exports for convenience
pub use error::{IdentityError, ProtocolError, SensorError, SessionError, StoreError};
pub use geo::{fit_viewport, Bounds, LatLng, LocationSample, Viewport};
pub use identity::{resolve_identity, AnonymousIdentity, Identity};
pub use interpolate::{
    FrameQueue, FrameScheduler, InterpolationConfig, MarkerRenderData, PositionInterpolator,
};
pub use prefs::{MemoryPreferences, PreferenceStore};
pub use presence::{ActiveBroadcaster, PresenceView};
pub use protocol::{BroadcasterProfile, RecordWrite, Snapshot, StoredRecord, LOCATIONS_COLLECTION};
pub use relay::{RelayConfig, RelayServer, RelayStore};
pub use runtime::{
    spawn_session, spawn_viewer, SessionHandle, SessionStatus, ViewerConfig, ViewerFrame,
    ViewerHandle,
};
pub use session::{SampleOutcome, SessionConfig, SessionController, SessionState};
pub use source::{
    DeviceSources, LocationSource, RealLocationSource, Sensor, SimulatedLocationSource,
    SimulationConfig, SourceProvider, WatchOptions,
};
pub use store::{MemoryStore, SnapshotEvent, SyncStore};
pub use throttle::Throttle;
