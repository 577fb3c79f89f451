//! Async drivers: one event loop per session, one per viewer.
//!
//! ```text
//!  SessionHandle ──commands──┐
//!  LocationSource ──samples──┼──► run_session (select!) ──► SessionController
//!  SyncStore ──snapshots─────┘            │
//!                                         └──► watch::Sender<SessionStatus>
//!
//!  SyncStore ──snapshots──┐
//!  frame ticker (16 ms) ──┴──► run_viewer (select!) ──► PositionInterpolator
//!                                         │
//!                                         └──► watch::Sender<ViewerFrame>
//! ```
//!
//! All inputs of a session are serialized through a single loop, so the
//! controller never sees two events at once. Time is read from
//! `tokio::time::Instant` so paused-clock tests drive the throttle and the
//! animations deterministically.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{SessionError, StoreError};
use crate::geo::Viewport;
use crate::interpolate::{InterpolationConfig, MarkerRenderData, PositionInterpolator};
use crate::presence::PresenceView;
use crate::protocol::{BroadcasterProfile, LOCATIONS_COLLECTION};
use crate::session::{SessionController, SessionState};
use crate::source::SourceMessage;
use crate::store::{SnapshotEvent, SnapshotReceiver, SyncStore};

type Reply = oneshot::Sender<Result<(), SessionError>>;

/// Commands accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    Start { profile: BroadcasterProfile, reply: Reply },
    Stop { reply: Reply },
    /// Subscribe again after the snapshot stream failed.
    Resubscribe { reply: Reply },
    /// Best-effort stop, then exit the loop.
    Teardown,
}

/// Observable state of a running session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub is_broadcasting: bool,
    pub self_id: Option<String>,
    /// Active broadcasters in the latest snapshot, renderable or not.
    pub active_count: usize,
    /// Latest surfaced error, cleared by a successful start.
    pub last_error: Option<SessionError>,
}

impl SessionStatus {
    fn capture(controller: &SessionController, active_count: usize, last_error: &Option<SessionError>) -> Self {
        Self {
            state: controller.state(),
            is_broadcasting: controller.is_broadcasting(),
            self_id: controller.self_id().map(str::to_string),
            active_count,
            last_error: last_error.clone(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Session driver
// ───────────────────────────────────────────────────────────────────

/// Handle to a spawned session loop.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn start(&self, profile: BroadcasterProfile) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Start { profile, reply }).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Stop { reply }).await
    }

    pub async fn resubscribe(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Resubscribe { reply }).await
    }

    /// Fire the teardown hook without waiting for it.
    pub fn teardown(&self) {
        if self.commands.try_send(SessionCommand::Teardown).is_err() {
            log::debug!("Teardown not delivered; session loop busy or gone");
        }
    }

    /// Tear down and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Teardown).await;
        if let Err(e) = self.task.await {
            log::warn!("Session task ended abnormally: {e}");
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`. `None` if the loop exited.
    pub async fn wait_for<F>(&self, predicate: F) -> Option<SessionStatus>
    where
        F: FnMut(&SessionStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let status = rx.wait_for(predicate).await.ok()?.clone();
        Some(status)
    }

    async fn request<F>(&self, command: F) -> Result<(), SessionError>
    where
        F: FnOnce(Reply) -> SessionCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }
}

/// Subscribe to the session's collection and run the controller in a task.
pub fn spawn_session(mut controller: SessionController) -> Result<SessionHandle, SessionError> {
    let collection = controller.config().collection.clone();
    let snapshots = controller.store().subscribe(&collection).map_err(|e| {
        let err = SessionError::Snapshot(e);
        log::error!("{err}");
        err
    })?;
    let source_rx = controller.take_source_rx();

    let (command_tx, command_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = watch::channel(SessionStatus::capture(&controller, 0, &None));

    let task = tokio::spawn(run_session(controller, command_rx, source_rx, snapshots, status_tx));
    Ok(SessionHandle {
        commands: command_tx,
        status: status_rx,
        task,
    })
}

async fn run_session(
    mut controller: SessionController,
    mut commands: mpsc::Receiver<SessionCommand>,
    mut source_rx: Option<mpsc::UnboundedReceiver<SourceMessage>>,
    snapshots: SnapshotReceiver,
    status: watch::Sender<SessionStatus>,
) {
    let collection = controller.config().collection.clone();
    let mut snapshots = Some(snapshots);
    let mut active_count = 0;
    let mut last_error: Option<SessionError> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Start { profile, reply }) => {
                    let result = controller.start(profile);
                    last_error = result.as_ref().err().cloned();
                    let _ = reply.send(result);
                }
                Some(SessionCommand::Stop { reply }) => {
                    let result = controller.stop();
                    if let Err(e) = &result {
                        last_error = Some(e.clone());
                    }
                    let _ = reply.send(result);
                }
                Some(SessionCommand::Resubscribe { reply }) => {
                    let result = match controller.store().subscribe(&collection) {
                        Ok(rx) => {
                            snapshots = Some(rx);
                            Ok(())
                        }
                        Err(e) => Err(SessionError::Snapshot(e)),
                    };
                    if let Err(e) = &result {
                        last_error = Some(e.clone());
                    }
                    let _ = reply.send(result);
                }
                Some(SessionCommand::Teardown) | None => {
                    controller.teardown();
                    status.send_replace(SessionStatus::capture(&controller, active_count, &last_error));
                    break;
                }
            },

            Some(message) = next_source(&mut source_rx) => {
                let now = Instant::now().into_std();
                if let Err(e) = controller.handle_source_message(message, now) {
                    if e.is_surfaced() {
                        last_error = Some(e);
                    }
                }
            }

            event = next_snapshot(&mut snapshots) => match event {
                Ok(SnapshotEvent::Snapshot(snapshot)) => {
                    active_count = snapshot.len();
                    controller.observe(&snapshot);
                }
                Ok(SnapshotEvent::Error(e)) => {
                    let err = SessionError::Snapshot(e);
                    log::error!("{err}");
                    last_error = Some(err);
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Session skipped {n} snapshots");
                }
                Err(RecvError::Closed) => {
                    let err = SessionError::Snapshot(StoreError::Closed);
                    log::error!("{err}");
                    last_error = Some(err);
                    snapshots = None;
                }
            },
        }

        let next = SessionStatus::capture(&controller, active_count, &last_error);
        status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
    log::debug!("Session loop exited");
}

async fn next_source(rx: &mut Option<mpsc::UnboundedReceiver<SourceMessage>>) -> Option<SourceMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_snapshot(rx: &mut Option<SnapshotReceiver>) -> Result<SnapshotEvent, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ───────────────────────────────────────────────────────────────────
// Viewer driver
// ───────────────────────────────────────────────────────────────────

/// Viewer configuration.
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub collection: String,
    /// Display refresh period driving the animations
    pub frame_interval: Duration,
    pub interpolation: InterpolationConfig,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            collection: LOCATIONS_COLLECTION.to_string(),
            frame_interval: Duration::from_millis(16),
            interpolation: InterpolationConfig::default(),
        }
    }
}

/// What the map shows after a snapshot or an animation frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewerFrame {
    pub markers: Vec<MarkerRenderData>,
    pub active_count: usize,
    pub self_broadcasting: bool,
    /// Last fitted viewport; kept while nothing is renderable.
    pub viewport: Option<Viewport>,
    /// Set while the snapshot stream is failing; the view is stale.
    pub error: Option<StoreError>,
}

/// Commands accepted by a running viewer.
#[derive(Debug)]
pub enum ViewerCommand {
    /// Subscribe again after the snapshot stream failed.
    Resubscribe {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Shutdown,
}

/// Handle to a spawned viewer loop. Dropping it stops the loop.
pub struct ViewerHandle {
    frames: watch::Receiver<ViewerFrame>,
    commands: mpsc::Sender<ViewerCommand>,
    task: JoinHandle<()>,
}

impl ViewerHandle {
    pub fn frame(&self) -> ViewerFrame {
        self.frames.borrow().clone()
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<ViewerFrame> {
        self.frames.clone()
    }

    /// Wait until a frame satisfies `predicate`. `None` if the loop exited.
    pub async fn wait_for<F>(&self, predicate: F) -> Option<ViewerFrame>
    where
        F: FnMut(&ViewerFrame) -> bool,
    {
        let mut rx = self.frames.clone();
        let frame = rx.wait_for(predicate).await.ok()?.clone();
        Some(frame)
    }

    /// Replace the snapshot stream with a fresh subscription.
    ///
    /// Markers keep their rendered positions; the next snapshot retargets them.
    pub async fn resubscribe(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ViewerCommand::Resubscribe { reply })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(ViewerCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            log::warn!("Viewer task ended abnormally: {e}");
        }
    }
}

/// Subscribe to `config.collection` and animate every active broadcaster.
pub fn spawn_viewer(
    store: Arc<dyn SyncStore>,
    self_id: Option<String>,
    config: ViewerConfig,
) -> Result<ViewerHandle, StoreError> {
    let snapshots = store.subscribe(&config.collection)?;
    let (frame_tx, frame_rx) = watch::channel(ViewerFrame::default());
    let (command_tx, command_rx) = mpsc::channel(8);
    let task = tokio::spawn(run_viewer(store, snapshots, self_id, config, frame_tx, command_rx));
    Ok(ViewerHandle {
        frames: frame_rx,
        commands: command_tx,
        task,
    })
}

async fn run_viewer(
    store: Arc<dyn SyncStore>,
    snapshots: SnapshotReceiver,
    self_id: Option<String>,
    config: ViewerConfig,
    frames: watch::Sender<ViewerFrame>,
    mut commands: mpsc::Receiver<ViewerCommand>,
) {
    let mut snapshots = Some(snapshots);
    let mut interpolator = PositionInterpolator::new(config.interpolation);
    let mut view = PresenceView::default();
    let mut viewport = None;
    let mut error = None;

    let mut ticker = tokio::time::interval(config.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ViewerCommand::Resubscribe { reply }) => {
                    let result = store.subscribe(&config.collection).map(|rx| {
                        snapshots = Some(rx);
                        log::info!("Viewer resubscribed to {}", config.collection);
                    });
                    if let Err(e) = &result {
                        log::error!("{}", SessionError::Snapshot(e.clone()));
                    }
                    let _ = reply.send(result);
                    continue;
                }
                Some(ViewerCommand::Shutdown) | None => break,
            },

            event = next_snapshot(&mut snapshots) => match event {
                Ok(SnapshotEvent::Snapshot(snapshot)) => {
                    view = PresenceView::derive(&snapshot, self_id.as_deref());
                    interpolator.sync(&view, Instant::now().into_std());
                    if let Some(fitted) = view.viewport() {
                        viewport = Some(fitted);
                    }
                    error = None;
                    log::trace!("Snapshot with {} broadcasters", view.active_count());
                }
                Ok(SnapshotEvent::Error(e)) => {
                    log::error!("{}", SessionError::Snapshot(e.clone()));
                    error = Some(e);
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Viewer skipped {n} snapshots");
                    continue;
                }
                Err(RecvError::Closed) => {
                    log::error!("{}", SessionError::Snapshot(StoreError::Closed));
                    error = Some(StoreError::Closed);
                    snapshots = None;
                }
            },

            _ = ticker.tick(), if !interpolator.is_settled() => {
                interpolator.on_frame(Instant::now().into_std());
            }
        }

        frames.send_replace(ViewerFrame {
            markers: interpolator.render(&view),
            active_count: view.active_count(),
            self_broadcasting: view.self_broadcasting(),
            viewport,
            error: error.clone(),
        });
    }
    interpolator.clear();
    log::debug!("Viewer loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::LatLng;
    use crate::identity::AnonymousIdentity;
    use crate::prefs::MemoryPreferences;
    use crate::protocol::{RecordWrite, LOCATIONS_COLLECTION};
    use crate::session::SessionConfig;
    use crate::source::{DeviceSources, SimulationConfig, SIMULATION_TICK};
    use crate::store::MemoryStore;

    fn session(store: Arc<MemoryStore>) -> SessionController {
        SessionController::new(
            SessionConfig::default(),
            store,
            Arc::new(AnonymousIdentity::with_id("U1")),
            Box::new(MemoryPreferences::new()),
            Box::new(DeviceSources::simulated(SimulationConfig {
                seed: Some(3),
                ..SimulationConfig::default()
            })),
        )
    }

    fn put_position(store: &MemoryStore, id: &str, lat: f64, lng: f64, create: bool) {
        let write = if create {
            RecordWrite::Create {
                profile: BroadcasterProfile::new("9", "V", false),
                position: LatLng::new(lat, lng),
            }
        } else {
            RecordWrite::Position {
                position: LatLng::new(lat, lng),
            }
        };
        let merge = write.merge();
        store
            .put(LOCATIONS_COLLECTION, id, write.into_fields(), merge)
            .unwrap();
    }

    // ── Session loop tests ───────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_session_loop_start_and_stop() {
        let store = Arc::new(MemoryStore::default());
        let handle = spawn_session(session(store.clone())).unwrap();

        handle.start(BroadcasterProfile::new("101A", "T", true)).await.unwrap();
        let status = handle.wait_for(|s| s.is_broadcasting).await.unwrap();
        assert_eq!(status.state, SessionState::Active);
        assert_eq!(status.self_id.as_deref(), Some("U1"));
        assert_eq!(status.active_count, 1);

        handle.stop().await.unwrap();
        let status = handle
            .wait_for(|s| s.state == SessionState::Idle)
            .await
            .unwrap();
        assert!(!status.is_broadcasting);
        assert!(store.snapshot(LOCATIONS_COLLECTION).is_empty());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loop_reports_validation_error() {
        let store = Arc::new(MemoryStore::default());
        let handle = spawn_session(session(store.clone())).unwrap();

        let result = handle.start(BroadcasterProfile::new("", "X", true)).await;
        assert!(matches!(result, Err(SessionError::Validation(_))));
        assert!(store.writes().is_empty());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loop_simulated_ticks_update_record() {
        let store = Arc::new(MemoryStore::default());
        let handle = spawn_session(session(store.clone())).unwrap();
        handle.start(BroadcasterProfile::new("101A", "T", true)).await.unwrap();
        handle.wait_for(|s| s.is_broadcasting).await.unwrap();

        tokio::time::sleep(SIMULATION_TICK * 2 + Duration::from_millis(10)).await;
        let puts = store
            .writes()
            .iter()
            .filter(|w| matches!(w, crate::store::WriteOp::Put { merge: true, .. }))
            .count();
        assert_eq!(puts, 2);
        handle.shutdown().await;
        assert!(store.snapshot(LOCATIONS_COLLECTION).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_hook_stops_broadcast() {
        let store = Arc::new(MemoryStore::default());
        let handle = spawn_session(session(store.clone())).unwrap();
        handle.start(BroadcasterProfile::new("101A", "T", true)).await.unwrap();
        handle.wait_for(|s| s.is_broadcasting).await.unwrap();

        handle.teardown();
        assert!(handle.wait_for(|_| false).await.is_none());
        assert!(store.snapshot(LOCATIONS_COLLECTION).is_empty());
    }

    #[tokio::test]
    async fn test_session_loop_surfaces_snapshot_error() {
        let store = Arc::new(MemoryStore::default());
        let handle = spawn_session(session(store.clone())).unwrap();
        store.fail_subscribers(
            LOCATIONS_COLLECTION,
            StoreError::Subscription("permission denied".into()),
        );
        let status = handle.wait_for(|s| s.last_error.is_some()).await.unwrap();
        assert!(matches!(status.last_error, Some(SessionError::Snapshot(_))));

        handle.resubscribe().await.unwrap();
        handle.shutdown().await;
    }

    // ── Viewer loop tests ────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_viewer_animates_to_new_position() {
        let store = Arc::new(MemoryStore::default());
        put_position(&store, "bus", 1.0, 1.0, true);
        let viewer = spawn_viewer(store.clone(), None, ViewerConfig::default()).unwrap();

        let frame = viewer.wait_for(|f| f.markers.len() == 1).await.unwrap();
        assert_eq!(frame.markers[0].position, LatLng::new(1.0, 1.0));
        assert!(matches!(frame.viewport, Some(Viewport::Fit { .. })));

        put_position(&store, "bus", 2.0, 1.0, false);
        let frame = viewer
            .wait_for(|f| f.markers.first().is_some_and(|m| m.position.lat > 1.0 && m.position.lat < 2.0))
            .await
            .unwrap();
        assert_eq!(frame.markers[0].coords_label, "Coords: 2.00000, 1.00000");

        let frame = viewer
            .wait_for(|f| f.markers.first().is_some_and(|m| m.position == LatLng::new(2.0, 1.0)))
            .await
            .unwrap();
        assert_eq!(frame.active_count, 1);

        viewer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_removes_departed_marker() {
        let store = Arc::new(MemoryStore::default());
        put_position(&store, "bus", 1.0, 1.0, true);
        let viewer = spawn_viewer(store.clone(), Some("bus".into()), ViewerConfig::default()).unwrap();
        let frame = viewer.wait_for(|f| f.markers.len() == 1).await.unwrap();
        assert!(frame.self_broadcasting);

        store.delete(LOCATIONS_COLLECTION, "bus").unwrap();
        let frame = viewer.wait_for(|f| f.active_count == 0).await.unwrap();
        assert!(frame.markers.is_empty());
        assert!(!frame.self_broadcasting);
        assert_eq!(frame.viewport, Some(Viewport::default_view()));
        viewer.shutdown().await;
    }

    /// Store whose subscriptions can be cut, closing every stream.
    struct DroppableStore {
        inner: MemoryStore,
        senders: std::sync::Mutex<Vec<tokio::sync::broadcast::Sender<SnapshotEvent>>>,
    }

    impl DroppableStore {
        fn cut(&self) {
            self.senders.lock().unwrap().clear();
        }
    }

    impl SyncStore for DroppableStore {
        fn subscribe(&self, collection: &str) -> Result<SnapshotReceiver, StoreError> {
            let (tx, rx) = tokio::sync::broadcast::channel(16);
            tx.send(SnapshotEvent::Snapshot(self.inner.snapshot(collection))).unwrap();
            self.senders.lock().unwrap().push(tx);
            Ok(rx)
        }

        fn put(&self, collection: &str, id: &str, fields: crate::protocol::Fields, merge: bool) -> Result<(), StoreError> {
            self.inner.put(collection, id, fields, merge)?;
            let snapshot = self.inner.snapshot(collection);
            for tx in self.senders.lock().unwrap().iter() {
                let _ = tx.send(SnapshotEvent::Snapshot(snapshot.clone()));
            }
            Ok(())
        }

        fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
            self.inner.delete(collection, id)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_resubscribes_after_error() {
        let store = Arc::new(MemoryStore::default());
        put_position(&store, "bus", 1.0, 1.0, true);
        let viewer = spawn_viewer(store.clone(), None, ViewerConfig::default()).unwrap();
        viewer.wait_for(|f| f.markers.len() == 1).await.unwrap();

        store.fail_subscribers(LOCATIONS_COLLECTION, StoreError::Subscription("denied".into()));
        let frame = viewer.wait_for(|f| f.error.is_some()).await.unwrap();
        assert_eq!(frame.markers.len(), 1);

        viewer.resubscribe().await.unwrap();
        let frame = viewer.wait_for(|f| f.error.is_none()).await.unwrap();
        assert_eq!(frame.active_count, 1);
        viewer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_recovers_from_closed_stream() {
        let store = Arc::new(DroppableStore {
            inner: MemoryStore::default(),
            senders: std::sync::Mutex::new(Vec::new()),
        });
        let viewer = spawn_viewer(store.clone(), None, ViewerConfig::default()).unwrap();
        viewer.wait_for(|f| f.error.is_none()).await.unwrap();

        store.cut();
        let frame = viewer
            .wait_for(|f| f.error == Some(StoreError::Closed))
            .await
            .unwrap();
        assert_eq!(frame.active_count, 0);

        // Writes while the stream is closed are invisible until resubscribing.
        let write = RecordWrite::Create {
            profile: BroadcasterProfile::new("5", "K", false),
            position: LatLng::new(2.0, 3.0),
        };
        store
            .put(LOCATIONS_COLLECTION, "bus", write.into_fields(), false)
            .unwrap();
        viewer.resubscribe().await.unwrap();

        let frame = viewer
            .wait_for(|f| f.error.is_none() && f.markers.len() == 1)
            .await
            .unwrap();
        assert_eq!(frame.markers[0].position, LatLng::new(2.0, 3.0));

        store.put(
            LOCATIONS_COLLECTION,
            "bus",
            RecordWrite::Position { position: LatLng::new(2.5, 3.0) }.into_fields(),
            true,
        )
        .unwrap();
        viewer
            .wait_for(|f| f.markers.first().is_some_and(|m| m.position == LatLng::new(2.5, 3.0)))
            .await
            .unwrap();
        viewer.shutdown().await;
    }
}
