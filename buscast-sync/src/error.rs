//! Error types for every collaborator and the session taxonomy.
//!
//! Propagation policy: anything that would leave "is broadcasting" wrong is
//! surfaced to the caller. Periodic position-update writes fail often and heal
//! on the next sample, so those are logged and swallowed.

/// Wire encoding failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid message type")]
    InvalidMessageType,
}

/// Failures reported by a `SyncStore`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store connection closed")]
    Closed,
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("subscription failed: {0}")]
    Subscription(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures of a location source.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SensorError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    Unavailable(String),
    #[error("timed out waiting for a position fix")]
    Timeout,
    #[error("geolocation is not supported: {0}")]
    Unsupported(String),
}

/// Identity provisioning failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity provisioning failed: {0}")]
    Provisioning(String),
}

/// Errors produced by the broadcast session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// Identity could not be resolved, even after one re-authentication.
    #[error("authentication failed: {0}")]
    Auth(#[from] IdentityError),

    /// Required profile fields are empty. Never reaches the network.
    #[error("{0}")]
    Validation(String),

    /// The location source errored; its watch has been cleared.
    #[error("location error: {0}. Please enable location services.")]
    Sensor(#[from] SensorError),

    /// The record-creating write failed; the session is not broadcasting.
    #[error("failed to start broadcasting: {0}")]
    InitialWrite(StoreError),

    /// A periodic position update failed. Logged only.
    #[error("failed to update location: {0}")]
    UpdateWrite(StoreError),

    /// The store subscription errored; the active view is stale.
    #[error("failed to listen to locations: {0}")]
    Snapshot(StoreError),

    /// Deleting the record on stop failed.
    #[error("failed to stop broadcasting: {0}")]
    Stop(StoreError),

    /// `start()` or a profile edit while a session is already running.
    #[error("already broadcasting")]
    AlreadyBroadcasting,

    /// The session driver task is no longer running.
    #[error("session driver has shut down")]
    Shutdown,
}

impl SessionError {
    /// Whether the error should be shown to the user.
    pub fn is_surfaced(&self) -> bool {
        !matches!(self, SessionError::UpdateWrite(_))
    }
}
