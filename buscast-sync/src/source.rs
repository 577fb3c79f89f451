//! Location sources: a real continuous sensor watch or a simulated walk.
//!
//! Every source delivers into a [`SampleSink`]. The sink carries the
//! session's manual-stop flag and generation, so a source never emits once
//! its session was stopped, and messages from an older session are told
//! apart by the controller.
//!
//! ```text
//! Sensor::watch ──┐
//!                 ├──► SampleSink ──► mpsc ──► SessionController
//! RandomWalk tick ┘     (stop flag checked before every emit)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SensorError;
use crate::geo::{LatLng, LocationSample, COORDINATE_VARIATION, DEFAULT_COORDINATES, SIMULATION_STEP};

/// Interval between simulated samples.
pub const SIMULATION_TICK: Duration = Duration::from_millis(3000);

/// What a source reports.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Sample(LocationSample),
    Error(SensorError),
}

/// A source event tagged with the session generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    pub generation: u64,
    pub event: SourceEvent,
}

/// Which kind of source a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Real,
    Simulated,
}

// ───────────────────────────────────────────────────────────────────
// Sink
// ───────────────────────────────────────────────────────────────────

/// Delivery endpoint handed to a source when it starts.
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: mpsc::UnboundedSender<SourceMessage>,
    stopped: Arc<AtomicBool>,
    generation: u64,
}

impl SampleSink {
    pub fn new(tx: mpsc::UnboundedSender<SourceMessage>, stopped: Arc<AtomicBool>, generation: u64) -> Self {
        Self { tx, stopped, generation }
    }

    /// Whether the owning session was manually stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Deliver a sample. Returns `false` if stopped or the receiver is gone.
    pub fn emit(&self, sample: LocationSample) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.send(SourceEvent::Sample(sample))
    }

    /// Deliver a source failure.
    pub fn fail(&self, error: SensorError) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.send(SourceEvent::Error(error))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn send(&self, event: SourceEvent) -> bool {
        self.tx
            .send(SourceMessage {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// A producer of position samples.
///
/// `cancel` must be idempotent.
pub trait LocationSource: Send {
    fn start(&mut self, sink: SampleSink) -> Result<(), SensorError>;
    fn cancel(&mut self);
    fn kind(&self) -> SourceKind;
}

// ───────────────────────────────────────────────────────────────────
// Real sensor
// ───────────────────────────────────────────────────────────────────

/// Options passed to the sensor watch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Maximum wait for a fix before the sensor reports a timeout.
    pub timeout: Duration,
    /// Oldest cached position the sensor may return.
    pub maximum_age: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_millis(5000),
            maximum_age: Duration::ZERO,
        }
    }
}

pub type WatchHandle = u64;

/// Continuous position-watch collaborator (device GPS).
pub trait Sensor: Send + Sync {
    fn watch(&self, sink: SampleSink, options: WatchOptions) -> Result<WatchHandle, SensorError>;
    fn clear_watch(&self, handle: WatchHandle);
}

/// Source backed by a device sensor.
pub struct RealLocationSource {
    sensor: Option<Arc<dyn Sensor>>,
    options: WatchOptions,
    handle: Option<WatchHandle>,
}

impl RealLocationSource {
    /// `sensor: None` models a platform without geolocation.
    pub fn new(sensor: Option<Arc<dyn Sensor>>, options: WatchOptions) -> Self {
        Self {
            sensor,
            options,
            handle: None,
        }
    }

    pub fn is_watching(&self) -> bool {
        self.handle.is_some()
    }
}

impl LocationSource for RealLocationSource {
    fn start(&mut self, sink: SampleSink) -> Result<(), SensorError> {
        let sensor = self
            .sensor
            .clone()
            .ok_or_else(|| SensorError::Unsupported("no location sensor available".into()))?;
        if sink.is_stopped() {
            return Ok(());
        }
        self.cancel();
        self.handle = Some(sensor.watch(sink, self.options)?);
        log::debug!("Sensor watch started (high accuracy: {})", self.options.high_accuracy);
        Ok(())
    }

    fn cancel(&mut self) {
        if let (Some(handle), Some(sensor)) = (self.handle.take(), self.sensor.as_ref()) {
            sensor.clear_watch(handle);
            log::debug!("Sensor watch {handle} cleared");
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Real
    }
}

impl Drop for RealLocationSource {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ───────────────────────────────────────────────────────────────────
// Simulation
// ───────────────────────────────────────────────────────────────────

/// Parameters of the simulated random walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationConfig {
    pub anchor: LatLng,
    /// Full width of the initial perturbation around the anchor.
    pub variation: f64,
    /// Maximum per-axis move of one tick.
    pub step: f64,
    pub tick: Duration,
    /// Fixed seed for reproducible walks; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            anchor: DEFAULT_COORDINATES,
            variation: COORDINATE_VARIATION,
            step: SIMULATION_STEP,
            tick: SIMULATION_TICK,
            seed: None,
        }
    }
}

/// Bounded random walk around an anchor.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    position: LatLng,
    step: f64,
    rng: StdRng,
}

impl RandomWalk {
    /// Starts within ±variation/2 of the anchor on each axis.
    pub fn new(config: &SimulationConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let half = config.variation / 2.0;
        let dlat = rng.gen::<f64>() * config.variation - half;
        let dlng = rng.gen::<f64>() * config.variation - half;
        Self {
            position: config.anchor.offset(dlat, dlng),
            step: config.step,
            rng,
        }
    }

    /// Move by at most ±step on each axis and return the new position.
    pub fn next_sample(&mut self) -> LocationSample {
        let dlat = (self.rng.gen::<f64>() - 0.5) * self.step * 2.0;
        let dlng = (self.rng.gen::<f64>() - 0.5) * self.step * 2.0;
        self.position = self.position.offset(dlat, dlng);
        self.position
    }

    pub fn position(&self) -> LatLng {
        self.position
    }
}

/// Source emitting a random walk on a fixed tick. The first sample is
/// emitted immediately on start.
pub struct SimulatedLocationSource {
    config: SimulationConfig,
    task: Option<JoinHandle<()>>,
}

impl SimulatedLocationSource {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config, task: None }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl LocationSource for SimulatedLocationSource {
    fn start(&mut self, sink: SampleSink) -> Result<(), SensorError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SensorError::Unavailable("simulation requires a tokio runtime".into()))?;
        if sink.is_stopped() {
            return Ok(());
        }
        self.cancel();

        let mut walk = RandomWalk::new(&self.config);
        let tick = self.config.tick;
        log::info!("Simulation started near {:?}", walk.position());

        self.task = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                // Checked at emit time, not only at scheduling time.
                if sink.is_stopped() {
                    break;
                }
                if !sink.emit(walk.next_sample()) {
                    break;
                }
            }
            log::debug!("Simulation task for generation {} finished", sink.generation());
        }));
        Ok(())
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            log::debug!("Simulation cancelled");
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Simulated
    }
}

impl Drop for SimulatedLocationSource {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ───────────────────────────────────────────────────────────────────
// Provider
// ───────────────────────────────────────────────────────────────────

/// Builds the source a session runs, per the profile's `simulate` flag.
pub trait SourceProvider: Send {
    fn open(&self, simulate: bool) -> Box<dyn LocationSource>;
}

/// Device sensor for real sessions, random walk for simulated ones.
pub struct DeviceSources {
    pub sensor: Option<Arc<dyn Sensor>>,
    pub watch: WatchOptions,
    pub simulation: SimulationConfig,
}

impl DeviceSources {
    pub fn new(sensor: Option<Arc<dyn Sensor>>) -> Self {
        Self {
            sensor,
            watch: WatchOptions::default(),
            simulation: SimulationConfig::default(),
        }
    }

    /// Simulation only; real sessions fail with `SensorError::Unsupported`.
    pub fn simulated(simulation: SimulationConfig) -> Self {
        Self {
            sensor: None,
            watch: WatchOptions::default(),
            simulation,
        }
    }
}

impl SourceProvider for DeviceSources {
    fn open(&self, simulate: bool) -> Box<dyn LocationSource> {
        if simulate {
            Box::new(SimulatedLocationSource::new(self.simulation))
        } else {
            Box::new(RealLocationSource::new(self.sensor.clone(), self.watch))
        }
    }
}
