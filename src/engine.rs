//! Debounced, hysteresis-protected occupancy state machine.
//!
//! The engine knows nothing about MQTT or wall-clock time. It reads the time
//! from a [`Clock`], gets samples from the caller (directly or through an
//! [`EnergySource`]), and reports results through an [`OccupancySink`] and an
//! optional [`ReasonSink`].

use std::fmt;
use std::time::Instant;

use log::{debug, info};

pub const DEFAULT_OCCUPIED_THRESHOLD: i32 = 50;
pub const DEFAULT_VACANT_THRESHOLD: i32 = 30;
pub const DEFAULT_DEBOUNCE_OCCUPIED_MS: u32 = 2000;
pub const DEFAULT_DEBOUNCE_VACANT_MS: u32 = 5000;

/// Millisecond counter. Allowed to wrap at `u32::MAX`.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

pub trait EnergySource {
    fn has_reading(&self) -> bool;
    fn reading(&self) -> f32;
}

pub trait OccupancySink {
    fn publish_occupancy(&self, occupied: bool);
}

pub trait ReasonSink {
    fn publish_reason(&self, reason: &str);
}

/// Milliseconds since construction, truncated to 32 bits like a hardware tick counter.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        // Truncation is the wraparound.
        self.started.elapsed().as_millis() as u32
    }
}

/// Most recent energy value seen by the host, if any.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestReading(Option<f32>);

impl LatestReading {
    pub fn update(&mut self, energy: f32) {
        self.0 = Some(energy);
    }
}

impl EnergySource for LatestReading {
    fn has_reading(&self) -> bool {
        self.0.is_some()
    }

    fn reading(&self) -> f32 {
        self.0.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Vacant,
    DebouncingOccupied,
    Occupied,
    DebouncingVacant,
}

impl PresenceState {
    /// The boolean last committed to the occupancy sink while in this state.
    pub fn is_occupied(self) -> bool {
        matches!(
            self,
            PresenceState::Occupied | PresenceState::DebouncingVacant
        )
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PresenceState::Vacant => "vacant",
            PresenceState::DebouncingOccupied => "debouncing_occupied",
            PresenceState::Occupied => "occupied",
            PresenceState::DebouncingVacant => "debouncing_vacant",
        };
        f.write_str(name)
    }
}

/// Why the engine entered its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Initial,
    OccupiedThresholdExceeded,
    DroppedDuringDebounce,
    OccupiedDebounceCompleted,
    VacantThresholdReached,
    IncreasedDuringDebounce,
    VacantDebounceCompleted,
}

impl TransitionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionReason::Initial => "Initial state: vacant",
            TransitionReason::OccupiedThresholdExceeded => "Energy exceeded occupied threshold",
            TransitionReason::DroppedDuringDebounce => "Energy dropped during debounce",
            TransitionReason::OccupiedDebounceCompleted
            | TransitionReason::VacantDebounceCompleted => "Debounce period completed",
            TransitionReason::VacantThresholdReached => "Energy dropped below vacant threshold",
            TransitionReason::IncreasedDuringDebounce => "Energy increased during debounce",
        }
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PresenceState,
    pub to: PresenceState,
    pub reason: TransitionReason,
}

/// Energy levels that arm each transition.
///
/// `vacant` is expected to sit below `occupied`. Nothing checks it: with the
/// pair inverted the dead band disappears and the output will chatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub occupied: i32,
    pub vacant: i32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            occupied: DEFAULT_OCCUPIED_THRESHOLD,
            vacant: DEFAULT_VACANT_THRESHOLD,
        }
    }
}

/// How long a qualifying reading must persist before each commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceDurations {
    pub occupied_ms: u32,
    pub vacant_ms: u32,
}

impl Default for DebounceDurations {
    fn default() -> Self {
        DebounceDurations {
            occupied_ms: DEFAULT_DEBOUNCE_OCCUPIED_MS,
            vacant_ms: DEFAULT_DEBOUNCE_VACANT_MS,
        }
    }
}

pub struct PresenceEngine<C, O> {
    clock: C,
    occupancy_sink: O,
    reason_sink: Option<Box<dyn ReasonSink>>,
    thresholds: Thresholds,
    debounce: DebounceDurations,
    state: PresenceState,
    debounce_start_ms: u32,
}

impl<C: Clock, O: OccupancySink> PresenceEngine<C, O> {
    pub fn new(clock: C, occupancy_sink: O) -> Self {
        PresenceEngine {
            clock,
            occupancy_sink,
            reason_sink: None,
            thresholds: Thresholds::default(),
            debounce: DebounceDurations::default(),
            state: PresenceState::Vacant,
            debounce_start_ms: 0,
        }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_debounce_durations(mut self, debounce: DebounceDurations) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_reason_sink(mut self, sink: Box<dyn ReasonSink>) -> Self {
        self.reason_sink = Some(sink);
        self
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn debounce_durations(&self) -> DebounceDurations {
        self.debounce
    }

    /// Forces the engine to `Vacant` and publishes that as the starting point.
    pub fn initialize(&mut self) {
        info!("Setting up presence engine");
        info!("  Occupied threshold: {}", self.thresholds.occupied);
        info!("  Vacant threshold: {}", self.thresholds.vacant);
        info!("  Debounce occupied: {} ms", self.debounce.occupied_ms);
        info!("  Debounce vacant: {} ms", self.debounce.vacant_ms);

        self.state = PresenceState::Vacant;
        self.debounce_start_ms = self.clock.now_ms();
        self.occupancy_sink.publish_occupancy(false);
        self.publish_reason(TransitionReason::Initial);
    }

    /// Feeds the source's current value to the engine. Without a reading the
    /// engine holds its state, however long that lasts.
    pub fn tick<S: EnergySource + ?Sized>(&mut self, source: &S) -> Option<Transition> {
        if !source.has_reading() {
            return None;
        }
        self.process_sample(source.reading())
    }

    /// Evaluates one sample and performs at most one transition.
    pub fn process_sample(&mut self, energy: f32) -> Option<Transition> {
        let occupied = self.thresholds.occupied as f32;
        let vacant = self.thresholds.vacant as f32;

        match self.state {
            PresenceState::Vacant => {
                if energy >= occupied {
                    return self.transition_to(
                        PresenceState::DebouncingOccupied,
                        TransitionReason::OccupiedThresholdExceeded,
                    );
                }
            }
            PresenceState::DebouncingOccupied => {
                if energy < occupied {
                    return self.transition_to(
                        PresenceState::Vacant,
                        TransitionReason::DroppedDuringDebounce,
                    );
                } else if self.is_debounce_complete(self.debounce.occupied_ms) {
                    let transition = self.transition_to(
                        PresenceState::Occupied,
                        TransitionReason::OccupiedDebounceCompleted,
                    );
                    self.occupancy_sink.publish_occupancy(true);
                    return transition;
                }
            }
            PresenceState::Occupied => {
                if energy <= vacant {
                    return self.transition_to(
                        PresenceState::DebouncingVacant,
                        TransitionReason::VacantThresholdReached,
                    );
                }
            }
            PresenceState::DebouncingVacant => {
                if energy > vacant {
                    return self.transition_to(
                        PresenceState::Occupied,
                        TransitionReason::IncreasedDuringDebounce,
                    );
                } else if self.is_debounce_complete(self.debounce.vacant_ms) {
                    let transition = self.transition_to(
                        PresenceState::Vacant,
                        TransitionReason::VacantDebounceCompleted,
                    );
                    self.occupancy_sink.publish_occupancy(false);
                    return transition;
                }
            }
        }
        None
    }

    /// Takes effect on the next sample. Ordering of the pair is not checked.
    pub fn update_thresholds(&mut self, occupied: i32, vacant: i32) {
        info!(
            "Updating thresholds: occupied={}, vacant={}",
            occupied, vacant
        );
        self.thresholds = Thresholds { occupied, vacant };
    }

    /// Takes effect on the next sample; a running debounce keeps its start time.
    pub fn update_debounce_durations(&mut self, occupied_ms: u32, vacant_ms: u32) {
        info!(
            "Updating debounce durations: occupied={} ms, vacant={} ms",
            occupied_ms, vacant_ms
        );
        self.debounce = DebounceDurations {
            occupied_ms,
            vacant_ms,
        };
    }

    fn transition_to(
        &mut self,
        new_state: PresenceState,
        reason: TransitionReason,
    ) -> Option<Transition> {
        if self.state == new_state {
            return None;
        }

        let from = self.state;
        debug!(
            "State transition: {} -> {}. Reason: {}",
            from, new_state, reason
        );
        self.state = new_state;
        self.debounce_start_ms = self.clock.now_ms();
        self.publish_reason(reason);

        Some(Transition {
            from,
            to: new_state,
            reason,
        })
    }

    fn is_debounce_complete(&self, required_ms: u32) -> bool {
        // Wrapping subtraction keeps this right across counter rollover.
        self.clock.now_ms().wrapping_sub(self.debounce_start_ms) >= required_ms
    }

    fn publish_reason(&self, reason: TransitionReason) {
        if let Some(sink) = &self.reason_sink {
            sink.publish_reason(reason.as_str());
        }
    }
}
