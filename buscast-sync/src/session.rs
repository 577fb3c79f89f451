//! Broadcast session lifecycle.
//!
//! ```text
//!            start()                first sample written
//!   Idle ───────────────► Starting ─────────────────────► Active
//!    ▲                      ▲  │ sensor error               │
//!    │                      │  └──────────► Idle            │ stop()
//!    │   snapshot without   │ record deleted elsewhere      ▼
//!    └──────────────────── Stopping ◄──────────────────── (any)
//!         self record
//! ```
//!
//! The store is authoritative for "is broadcasting": every observed
//! snapshot overwrites the flag. `stop()` flips it to false optimistically,
//! and the next snapshot confirms it. `start()` only arms sample acceptance;
//! the record, and with it the broadcast, exists once the first sample is
//! written.
//!
//! The manual-stop flag is evaluated at every acceptance point: in the
//! source sink before emitting, and here before writing. Source messages
//! carry the generation of the session that produced them, so anything
//! still queued from a previous session is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::{SensorError, SessionError};
use crate::geo::LocationSample;
use crate::identity::{resolve_identity, Identity};
use crate::prefs::{load_profile, save_profile, PreferenceStore};
use crate::protocol::{BroadcasterProfile, RecordWrite, Snapshot, LOCATIONS_COLLECTION};
use crate::source::{
    LocationSource, SampleSink, SourceEvent, SourceKind, SourceMessage, SourceProvider,
};
use crate::store::SyncStore;
use crate::throttle::{Throttle, DEFAULT_THROTTLE_INTERVAL};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Collection holding broadcast records
    pub collection: String,
    /// Minimum spacing of position updates after the first write
    pub throttle_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            collection: LOCATIONS_COLLECTION.to_string(),
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
        }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    /// Armed; waiting for the first sample to create the record
    Starting,
    /// Record written; forwarding throttled updates
    Active,
    /// Delete issued; waiting for a snapshot without our record
    Stopping,
}

/// What happened to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Full record written
    Created,
    /// Position update written
    Updated,
    /// Dropped inside the throttle window
    Throttled,
    /// Position update failed; logged and swallowed
    UpdateFailed,
    /// Not accepted: no session, manually stopped, or stale generation
    Ignored,
}

/// Owns the broadcast lifecycle for one identity.
pub struct SessionController {
    config: SessionConfig,
    store: Arc<dyn SyncStore>,
    identity: Arc<dyn Identity>,
    prefs: Box<dyn PreferenceStore>,
    sources: Box<dyn SourceProvider>,

    state: SessionState,
    self_id: Option<String>,
    /// Profile captured at `start()`, used for the record-creating write.
    profile: Option<BroadcasterProfile>,
    source: Option<Box<dyn LocationSource>>,
    throttle: Throttle,

    /// Manual-stop flag of the current generation, shared with its sink.
    stopped: Arc<AtomicBool>,
    generation: u64,

    /// Authoritative presence from the latest snapshot.
    is_broadcasting: bool,
    /// Our record has been seen in a snapshot since it was written.
    confirmed: bool,

    source_tx: mpsc::UnboundedSender<SourceMessage>,
    source_rx: Option<mpsc::UnboundedReceiver<SourceMessage>>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn SyncStore>,
        identity: Arc<dyn Identity>,
        prefs: Box<dyn PreferenceStore>,
        sources: Box<dyn SourceProvider>,
    ) -> Self {
        let (source_tx, source_rx) = mpsc::unbounded_channel();
        let throttle = Throttle::new(config.throttle_interval);
        Self {
            config,
            store,
            identity,
            prefs,
            sources,
            state: SessionState::Idle,
            self_id: None,
            profile: None,
            source: None,
            throttle,
            stopped: Arc::new(AtomicBool::new(false)),
            generation: 0,
            is_broadcasting: false,
            confirmed: false,
            source_tx,
            source_rx: Some(source_rx),
        }
    }

    /// Take the receiver of source messages (can only be called once).
    pub fn take_source_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SourceMessage>> {
        self.source_rx.take()
    }

    // ── Profile ──────────────────────────────────────────────────

    /// Profile stored in local preferences.
    pub fn saved_profile(&self) -> BroadcasterProfile {
        load_profile(self.prefs.as_ref())
    }

    /// Persist an edited profile. Rejected while broadcasting.
    pub fn update_profile(&mut self, profile: &BroadcasterProfile) -> Result<(), SessionError> {
        if self.is_live() || self.is_broadcasting {
            return Err(SessionError::AlreadyBroadcasting);
        }
        save_profile(self.prefs.as_mut(), profile);
        Ok(())
    }

    // ── Inputs ───────────────────────────────────────────────────

    /// Arm sample acceptance for a new session.
    ///
    /// Validates the profile, resolves the identity, persists the profile
    /// and starts the configured source. Does not mark the session active.
    pub fn start(&mut self, profile: BroadcasterProfile) -> Result<(), SessionError> {
        if self.is_live() {
            return Err(SessionError::AlreadyBroadcasting);
        }
        profile.validate()?;

        let id = resolve_identity(self.identity.as_ref()).map_err(|e| {
            let err = SessionError::Auth(e);
            log::error!("{err}");
            err
        })?;

        self.cancel_source();
        self.generation += 1;
        self.stopped = Arc::new(AtomicBool::new(false));
        save_profile(self.prefs.as_mut(), &profile);
        self.throttle.reset();
        self.confirmed = false;

        let mut source = self.sources.open(profile.simulate);
        let sink = SampleSink::new(self.source_tx.clone(), self.stopped.clone(), self.generation);
        if let Err(e) = source.start(sink) {
            source.cancel();
            self.stopped.store(true, Ordering::SeqCst);
            let err = SessionError::Sensor(e);
            log::error!("{err}");
            return Err(err);
        }

        log::info!(
            "Session {} armed for {id}: bus {} ({:?} source)",
            self.generation,
            profile.bus_no,
            source.kind()
        );
        self.self_id = Some(id);
        self.profile = Some(profile);
        self.source = Some(source);
        self.state = SessionState::Starting;
        Ok(())
    }

    /// Route a message from the source channel.
    pub fn handle_source_message(
        &mut self,
        msg: SourceMessage,
        now: Instant,
    ) -> Result<SampleOutcome, SessionError> {
        if msg.generation != self.generation {
            log::trace!("Dropping message from generation {}", msg.generation);
            return Ok(SampleOutcome::Ignored);
        }
        match msg.event {
            SourceEvent::Sample(sample) => self.sample_received(sample, now),
            SourceEvent::Error(error) => self.source_failed(error),
        }
    }

    /// Accept a position sample.
    ///
    /// The first sample of a session writes the full record and bypasses the
    /// throttle; later samples are throttled and merged as position updates.
    pub fn sample_received(
        &mut self,
        sample: LocationSample,
        now: Instant,
    ) -> Result<SampleOutcome, SessionError> {
        if self.manually_stopped() {
            log::trace!("Sample after manual stop ignored");
            return Ok(SampleOutcome::Ignored);
        }
        let id = match (self.state, self.self_id.as_ref()) {
            (SessionState::Starting | SessionState::Active, Some(id)) => id.clone(),
            _ => return Ok(SampleOutcome::Ignored),
        };

        if self.state == SessionState::Starting {
            let Some(profile) = self.profile.clone() else {
                return Ok(SampleOutcome::Ignored);
            };
            let write = RecordWrite::Create {
                profile,
                position: sample,
            };
            let merge = write.merge();
            return match self.store.put(&self.config.collection, &id, write.into_fields(), merge) {
                Ok(()) => {
                    self.throttle.mark(now);
                    self.state = SessionState::Active;
                    log::info!("Broadcasting as {id} from {:.5}, {:.5}", sample.lat, sample.lng);
                    Ok(SampleOutcome::Created)
                }
                Err(e) => {
                    let err = SessionError::InitialWrite(e);
                    log::error!("{err}");
                    Err(err)
                }
            };
        }

        if !self.throttle.admit(now) {
            log::trace!("Sample throttled");
            return Ok(SampleOutcome::Throttled);
        }
        let write = RecordWrite::Position { position: sample };
        let merge = write.merge();
        match self.store.put(&self.config.collection, &id, write.into_fields(), merge) {
            Ok(()) => Ok(SampleOutcome::Updated),
            Err(e) => {
                log::warn!("{}", SessionError::UpdateWrite(e));
                Ok(SampleOutcome::UpdateFailed)
            }
        }
    }

    /// The source errored: clear it and leave the session non-broadcasting.
    pub fn source_failed(&mut self, error: SensorError) -> Result<SampleOutcome, SessionError> {
        if self.manually_stopped() || !self.is_live() {
            return Ok(SampleOutcome::Ignored);
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel_source();
        self.throttle.reset();

        if self.state == SessionState::Active {
            if let Some(id) = self.self_id.clone() {
                if let Err(e) = self.store.delete(&self.config.collection, &id) {
                    log::warn!("Failed to remove record after location error: {e}");
                }
            }
            self.is_broadcasting = false;
            self.state = SessionState::Stopping;
        } else {
            self.state = SessionState::Idle;
        }

        let err = SessionError::Sensor(error);
        log::error!("{err}");
        Err(err)
    }

    /// Stop broadcasting and delete our record.
    ///
    /// Effective immediately for samples: in-flight callbacks and ticks are
    /// suppressed before the store round-trip completes.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel_source();
        self.throttle.reset();
        self.profile = None;
        self.confirmed = false;
        self.is_broadcasting = false;

        let known = self.identity.current_identity().or_else(|| self.self_id.clone());
        let id = match known {
            Some(id) => id,
            None => match resolve_identity(self.identity.as_ref()) {
                Ok(id) => id,
                Err(e) => {
                    self.state = SessionState::Idle;
                    let err = SessionError::Auth(e);
                    log::error!("{err}");
                    return Err(err);
                }
            },
        };

        log::info!("Stopping broadcast for {id}");
        self.self_id = Some(id.clone());
        self.state = SessionState::Stopping;
        self.store.delete(&self.config.collection, &id).map_err(|e| {
            let err = SessionError::Stop(e);
            log::error!("{err}");
            err
        })
    }

    /// Best-effort stop on page hide or shutdown. Errors are only logged.
    pub fn teardown(&mut self) {
        if self.is_live() || self.is_broadcasting {
            if let Err(e) = self.stop() {
                log::warn!("Stop during teardown failed: {e}");
            }
        } else {
            self.stopped.store(true, Ordering::SeqCst);
            self.cancel_source();
        }
    }

    /// Apply the authoritative presence signal.
    pub fn observe_presence(&mut self, self_record_exists: bool) {
        self.is_broadcasting = self_record_exists;
        match (self.state, self_record_exists) {
            (SessionState::Active, true) => self.confirmed = true,
            (SessionState::Active, false) if self.confirmed => {
                log::warn!("Broadcast record removed elsewhere; recreating on next sample");
                self.confirmed = false;
                self.throttle.reset();
                self.state = SessionState::Starting;
            }
            (SessionState::Stopping, false) => {
                log::info!("Broadcast stopped");
                self.state = SessionState::Idle;
            }
            _ => {}
        }
    }

    /// Apply a store snapshot.
    pub fn observe(&mut self, snapshot: &Snapshot) {
        let exists = self
            .self_id
            .clone()
            .or_else(|| self.identity.current_identity())
            .is_some_and(|id| snapshot.contains(&id));
        self.observe_presence(exists);
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_broadcasting(&self) -> bool {
        self.is_broadcasting
    }

    pub fn manually_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    /// Profile captured by the running session.
    pub fn active_profile(&self) -> Option<&BroadcasterProfile> {
        self.profile.as_ref()
    }

    pub fn source_kind(&self) -> Option<SourceKind> {
        self.source.as_ref().map(|s| s.kind())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn SyncStore> {
        self.store.clone()
    }

    fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Starting | SessionState::Active)
    }

    fn cancel_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.cancel();
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel_source();
    }
}
