//! Race phase machine
//!
//! One race's lifecycle: waiting room, countdown, racing, finished.
//! Transitions come from server events (and two local sources, the
//! timeout sampler and the optimistic finish); anything out of order
//! is ignored rather than trusted, the server view wins on conflict.

use tracing::{debug, warn};

use crate::core::protocol::{RaceInfo, Standing, WirePhase};

// =============================================================================
// PHASES
// =============================================================================

/// Lifecycle phase as the session sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Mounted, no race bound yet.
    #[default]
    Idle,
    Waiting,
    Countdown,
    Racing,
    Finished,
}

impl From<WirePhase> for Phase {
    fn from(phase: WirePhase) -> Self {
        match phase {
            WirePhase::Waiting => Phase::Waiting,
            WirePhase::Countdown => Phase::Countdown,
            WirePhase::Racing => Phase::Racing,
            WirePhase::Finished => Phase::Finished,
        }
    }
}

// =============================================================================
// RESULTS
// =============================================================================

/// Provenance of posted standings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsSource {
    /// Assembled locally after the optimistic-finish grace window.
    LocalEstimate,
    /// The server's final standings.
    Authoritative,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostedResults {
    pub standings: Vec<Standing>,
    pub source: ResultsSource,
}

// =============================================================================
// MACHINE
// =============================================================================

/// Phase transitions and the posted-results slot for one race.
#[derive(Debug, Default)]
pub struct RaceMachine {
    phase: Phase,
    race: Option<RaceInfo>,
    countdown_remaining: u32,
    results: Option<PostedResults>,
}

impl RaceMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn race(&self) -> Option<&RaceInfo> {
        self.race.as_ref()
    }

    pub fn countdown_remaining(&self) -> u32 {
        self.countdown_remaining
    }

    pub fn results(&self) -> Option<&PostedResults> {
        self.results.as_ref()
    }

    /// Adopt a race description and its current phase (join ack or
    /// snapshot refetch). Rebinding mid-session follows the new record;
    /// results survive only when the record itself is finished.
    pub fn bind(&mut self, race: RaceInfo) {
        self.phase = Phase::from(race.phase);
        self.countdown_remaining = 0;
        if race.phase != WirePhase::Finished {
            self.results = None;
        }
        self.race = Some(race);
    }

    /// `countdown_start`. Valid only in the waiting room; a repeat while
    /// already counting down changes nothing.
    pub fn begin_countdown(&mut self, seconds: u32) -> bool {
        match self.phase {
            Phase::Waiting => {
                self.phase = Phase::Countdown;
                self.countdown_remaining = seconds;
                true
            }
            Phase::Countdown => {
                debug!("[RACE] Duplicate countdown_start ignored");
                false
            }
            other => {
                warn!("[RACE] countdown_start in {:?} ignored", other);
                false
            }
        }
    }

    /// Local 1s tick between server countdown messages. Floors at zero;
    /// only the server starts the race.
    pub fn countdown_tick_local(&mut self) -> u32 {
        if self.phase == Phase::Countdown {
            self.countdown_remaining = self.countdown_remaining.saturating_sub(1);
        }
        self.countdown_remaining
    }

    /// Server countdown message with the authoritative seconds left.
    pub fn sync_countdown(&mut self, seconds: u32) {
        if self.phase == Phase::Countdown {
            self.countdown_remaining = seconds;
        }
    }

    /// `countdown_cancelled`: back to the waiting room.
    pub fn cancel_countdown(&mut self) -> bool {
        if self.phase != Phase::Countdown {
            debug!("[RACE] countdown_cancelled outside countdown ignored");
            return false;
        }
        self.phase = Phase::Waiting;
        self.countdown_remaining = 0;
        true
    }

    /// `race_start`. Valid from waiting or countdown; a duplicate while
    /// already racing is ignored. The message may carry a corrected
    /// text, start timestamp or time limit.
    pub fn begin_racing(
        &mut self,
        text: Option<&str>,
        started_at_ms: Option<u64>,
        time_limit_ms: Option<u64>,
    ) -> bool {
        match self.phase {
            Phase::Waiting | Phase::Countdown => {}
            Phase::Racing => {
                debug!("[RACE] Duplicate race_start ignored");
                return false;
            }
            other => {
                warn!("[RACE] race_start in {:?} ignored", other);
                return false;
            }
        }
        let Some(race) = self.race.as_mut() else {
            warn!("[RACE] race_start before any race was bound");
            return false;
        };

        if let Some(text) = text {
            race.text = text.to_string();
        }
        if started_at_ms.is_some() {
            race.started_at_ms = started_at_ms;
        }
        if time_limit_ms.is_some() {
            race.time_limit_ms = time_limit_ms;
        }
        race.phase = WirePhase::Racing;

        self.phase = Phase::Racing;
        self.countdown_remaining = 0;
        self.results = None;
        true
    }

    /// Server appended paragraph text mid-race. Nothing resets.
    pub fn extend_text(&mut self, appended: &str) {
        if let Some(race) = self.race.as_mut() {
            race.text.push_str(appended);
        }
    }

    /// Local finish (typed the last char, or the time limit expired).
    /// The results slot stays empty until either the server posts
    /// standings or the grace window expires.
    pub fn finish_local(&mut self) -> bool {
        if self.phase != Phase::Racing {
            return false;
        }
        self.phase = Phase::Finished;
        if let Some(race) = self.race.as_mut() {
            race.phase = WirePhase::Finished;
        }
        true
    }

    /// Grace window expired without `race_finished`: post the local
    /// estimate. Skipped when any results are already up.
    pub fn post_local_results(&mut self, standings: Vec<Standing>) -> bool {
        if self.phase != Phase::Finished || self.results.is_some() {
            return false;
        }
        self.results = Some(PostedResults {
            standings,
            source: ResultsSource::LocalEstimate,
        });
        true
    }

    /// `race_finished`: the authoritative standings. Replaces a local
    /// estimate exactly once; a repeat changes nothing.
    pub fn finish_authoritative(&mut self, standings: Vec<Standing>) -> bool {
        if matches!(
            self.results,
            Some(PostedResults {
                source: ResultsSource::Authoritative,
                ..
            })
        ) {
            debug!("[RACE] Duplicate race_finished ignored");
            return false;
        }
        self.phase = Phase::Finished;
        self.countdown_remaining = 0;
        if let Some(race) = self.race.as_mut() {
            race.phase = WirePhase::Finished;
        }
        self.results = Some(PostedResults {
            standings,
            source: ResultsSource::Authoritative,
        });
        true
    }
}
