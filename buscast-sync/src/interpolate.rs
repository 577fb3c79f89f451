//! Smooth marker motion between authoritative positions.
//!
//! Each marker is `Idle` or `Animating`. A new target starts a fixed-duration
//! linear interpolation from the currently rendered position, sampled once
//! per display frame:
//!
//! ```text
//! set_target(id, end, now)
//!       │  cancel in-flight frame, start = current
//!       ▼
//! FrameScheduler::request_frame ──► on_frame(now)
//!                                       │ p = clamp((now - t0) / duration, 0, 1)
//!                                       ├── p < 1: current = lerp(start, end, p), request next frame
//!                                       └── p = 1: current = end exactly, back to Idle
//! ```
//!
//! The scheduler is injected so the algorithm runs against a deterministic
//! clock in tests and a tokio interval in the viewer runtime.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::geo::LatLng;
use crate::presence::PresenceView;

/// Handle of a requested frame callback.
pub type FrameHandle = u64;

/// Display-refresh collaborator.
///
/// A requested frame fires once, on the next refresh tick, unless cancelled.
/// Cancelling a fired or unknown handle is a no-op.
pub trait FrameScheduler {
    fn request_frame(&mut self) -> FrameHandle;
    fn cancel_frame(&mut self, handle: FrameHandle);
    /// Handles firing on this tick, in request order.
    fn take_due(&mut self) -> Vec<FrameHandle>;
}

/// Scheduler where every pending frame fires on the next `take_due`.
#[derive(Debug, Default)]
pub struct FrameQueue {
    next_handle: FrameHandle,
    pending: BTreeSet<FrameHandle>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl FrameScheduler for FrameQueue {
    fn request_frame(&mut self) -> FrameHandle {
        self.next_handle += 1;
        self.pending.insert(self.next_handle);
        self.next_handle
    }

    fn cancel_frame(&mut self, handle: FrameHandle) {
        self.pending.remove(&handle);
    }

    fn take_due(&mut self) -> Vec<FrameHandle> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}

/// Interpolation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolationConfig {
    pub duration: Duration,
    /// Per-axis deltas below this snap without animating.
    pub snap_epsilon: f64,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(600),
            snap_epsilon: 1e-8,
        }
    }
}

/// An in-flight animation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Animation {
    pub handle: FrameHandle,
    pub start: LatLng,
    pub end: LatLng,
    pub started_at: Instant,
}

impl Animation {
    /// Normalized progress at `now`, clamped to `[0, 1]`.
    pub fn progress(&self, now: Instant, duration: Duration) -> f64 {
        if duration.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.started_at);
        (elapsed.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0)
    }
}

/// Render state of one marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderedPosition {
    pub current: LatLng,
    pub animation: Option<Animation>,
}

/// What the map draws for one marker.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerRenderData {
    pub id: String,
    pub position: LatLng,
    pub popup_label: String,
    pub coords_label: String,
    pub is_simulated: bool,
}

// ───────────────────────────────────────────────────────────────────
// Interpolator
// ───────────────────────────────────────────────────────────────────

/// Owns the render state of every visible marker.
pub struct PositionInterpolator<S: FrameScheduler = FrameQueue> {
    config: InterpolationConfig,
    scheduler: S,
    markers: HashMap<String, RenderedPosition>,
    by_handle: HashMap<FrameHandle, String>,
}

impl PositionInterpolator<FrameQueue> {
    pub fn new(config: InterpolationConfig) -> Self {
        Self::with_scheduler(config, FrameQueue::new())
    }
}

impl<S: FrameScheduler> PositionInterpolator<S> {
    pub fn with_scheduler(config: InterpolationConfig, scheduler: S) -> Self {
        Self {
            config,
            scheduler,
            markers: HashMap::new(),
            by_handle: HashMap::new(),
        }
    }

    /// Apply a new authoritative position for `id`.
    pub fn set_target(&mut self, id: &str, target: LatLng, now: Instant) {
        let eps = self.config.snap_epsilon;
        let Some(marker) = self.markers.get_mut(id) else {
            // First appearance: no animation.
            self.markers.insert(
                id.to_string(),
                RenderedPosition {
                    current: target,
                    animation: None,
                },
            );
            return;
        };

        if let Some(anim) = marker.animation.as_mut() {
            if anim.end.approx_eq(&target, eps) {
                // Same timing; the animation still lands on the latest value.
                anim.end = target;
                return;
            }
            self.scheduler.cancel_frame(anim.handle);
            self.by_handle.remove(&anim.handle);
            marker.animation = None;
        }

        if marker.current.approx_eq(&target, eps) {
            marker.current = target;
            return;
        }

        let handle = self.scheduler.request_frame();
        marker.animation = Some(Animation {
            handle,
            start: marker.current,
            end: target,
            started_at: now,
        });
        self.by_handle.insert(handle, id.to_string());
        log::trace!("Animating {id} toward {:.6}, {:.6}", target.lat, target.lng);
    }

    /// Advance every marker whose frame fired. Returns how many advanced.
    pub fn on_frame(&mut self, now: Instant) -> usize {
        let duration = self.config.duration;
        let mut advanced = 0;
        for handle in self.scheduler.take_due() {
            let Some(id) = self.by_handle.remove(&handle) else {
                continue;
            };
            let Some(marker) = self.markers.get_mut(&id) else {
                continue;
            };
            let Some(anim) = marker.animation.filter(|a| a.handle == handle) else {
                continue;
            };

            let p = anim.progress(now, duration);
            if p >= 1.0 {
                // Exact end value, no accumulated drift.
                marker.current = anim.end;
                marker.animation = None;
            } else {
                marker.current = anim.start.lerp(&anim.end, p);
                let next = self.scheduler.request_frame();
                marker.animation = Some(Animation { handle: next, ..anim });
                self.by_handle.insert(next, id);
            }
            advanced += 1;
        }
        advanced
    }

    /// Drop a marker and cancel its animation.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.markers.remove(id) {
            Some(marker) => {
                if let Some(anim) = marker.animation {
                    self.scheduler.cancel_frame(anim.handle);
                    self.by_handle.remove(&anim.handle);
                }
                true
            }
            None => false,
        }
    }

    /// Retarget every renderable broadcaster and drop markers no longer shown.
    pub fn sync(&mut self, view: &PresenceView, now: Instant) {
        for (broadcaster, position) in view.renderable() {
            self.set_target(&broadcaster.id, position, now);
        }
        let gone: Vec<String> = self
            .markers
            .keys()
            .filter(|id| view.get(id).map_or(true, |b| !b.has_valid_position()))
            .cloned()
            .collect();
        for id in gone {
            log::debug!("Marker {id} removed");
            self.remove(&id);
        }
    }

    /// Cancel every animation and forget all markers.
    pub fn clear(&mut self) {
        for (handle, _) in self.by_handle.drain() {
            self.scheduler.cancel_frame(handle);
        }
        self.markers.clear();
    }

    pub fn position(&self, id: &str) -> Option<LatLng> {
        self.markers.get(id).map(|m| m.current)
    }

    pub fn rendered(&self, id: &str) -> Option<&RenderedPosition> {
        self.markers.get(id)
    }

    pub fn is_animating(&self, id: &str) -> bool {
        self.markers.get(id).is_some_and(|m| m.animation.is_some())
    }

    /// True when no marker is animating.
    pub fn is_settled(&self) -> bool {
        self.by_handle.is_empty()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Markers to draw, labelled from the view.
    pub fn render(&self, view: &PresenceView) -> Vec<MarkerRenderData> {
        view.renderable()
            .filter_map(|(b, _)| {
                self.position(&b.id).map(|position| MarkerRenderData {
                    id: b.id.clone(),
                    position,
                    popup_label: b.popup_label(),
                    coords_label: b.coords_label(),
                    is_simulated: b.is_simulated,
                })
            })
            .collect()
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn config(&self) -> &InterpolationConfig {
        &self.config
    }
}

impl<S: FrameScheduler> Drop for PositionInterpolator<S> {
    fn drop(&mut self) {
        self.clear();
    }
}
