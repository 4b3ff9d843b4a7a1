//! Race session orchestrator
//!
//! RaceSession combines the phase machine, roster, typing tracker and
//! timer set behind the I/O trait seams, so the complete race logic is
//! testable on any platform. Every inbound envelope is dispatched here,
//! synchronously and in delivery order; handlers tolerate duplicates.

use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::core::constants::{
    COUNTDOWN_TICK, ELAPSED_TICK, EXTENSION_THRESHOLD, MAX_CHAT_LEN, RESULT_GRACE_WINDOW,
};
use crate::core::identity::{current_record, SelfRecord};
use crate::core::io::{EventSource, IdentityStore, IntentSink, LinkStatus, RaceDirectory, WireEvent};
use crate::core::protocol::{ErrorCode, Event, Intent, RaceSnapshot};
use crate::core::race::{Phase, RaceMachine, ResultsSource};
use crate::core::rematch::RematchOffer;
use crate::core::roster::{ChatEntry, Roster};
use crate::core::timers::{TimerKind, Timers};
use crate::core::typing::{InputEvent, InputRejection, TypingTracker};

// =============================================================================
// SESSION EVENTS
// =============================================================================

/// Events emitted by RaceSession for UI updates and logging.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection status changed
    ConnectionChanged(LinkStatus),
    /// Transport-level fault, for the non-blocking banner
    TransportFault(String),
    /// Join acknowledged; the room state is live
    Joined,
    /// Countdown display should show this many seconds
    CountdownTick(u32),
    /// The race is on; typing input is now accepted
    RaceStarted,
    /// Standings were posted (local estimate or authoritative)
    ResultsPosted(ResultsSource),
    /// A chat line was appended to the log
    ChatReceived,
    /// Server rejected a request
    Rejected { code: ErrorCode, message: String },
    /// The local participant was kicked; navigate away
    Removed,
    /// A follow-up race exists for this room
    RematchOffered { race_id: String, room_code: String },
    /// The server announced it is going down
    ServerShutdown(Option<String>),
    /// Local input was rejected (clipboard, or the race is over)
    InputRejected(InputRejection),
}

// =============================================================================
// RACE SESSION
// =============================================================================

/// One race view's complete client state.
///
/// The session is advanced by three explicit calls, all cheap and
/// non-blocking: `update` drains the wire, `poll` services timers,
/// `input` feeds committed keystrokes. Everything runs on the caller's
/// thread; the only suspension points live in the transport.
pub struct RaceSession {
    race_id: String,
    display_name: String,
    extension_threshold: f64,
    machine: RaceMachine,
    roster: Roster,
    tracker: Option<TypingTracker>,
    timers: Timers,
    identity: Option<SelfRecord>,
    self_id: Option<String>,
    link: LinkStatus,
    /// Cleared on every (re)connect; set again by the join ack.
    joined: bool,
    removed: bool,
    rematch: Option<RematchOffer>,
}

impl RaceSession {
    /// Mount a race view: pin the durable identity for this race id and
    /// pull the REST snapshot so an already-finished race renders its
    /// roster instead of an empty room. Snapshot failure is not fatal;
    /// the join ack rebuilds the same state.
    pub fn mount<I, D>(race_id: &str, display_name: &str, store: &I, directory: &D) -> Self
    where
        I: IdentityStore,
        D: RaceDirectory,
    {
        let identity = current_record(store, race_id);
        if identity.is_some() {
            debug!(race_id, "[SESSION] Resuming seat from identity record");
        }

        let mut session = Self {
            race_id: race_id.to_string(),
            display_name: display_name.to_string(),
            extension_threshold: EXTENSION_THRESHOLD,
            machine: RaceMachine::new(),
            roster: Roster::new(),
            tracker: None,
            timers: Timers::new(),
            identity,
            self_id: None,
            link: LinkStatus::Disconnected,
            joined: false,
            removed: false,
            rematch: None,
        };

        match directory.fetch_race(race_id) {
            Ok(snapshot) => session.adopt_snapshot(snapshot),
            Err(e) => debug!(race_id, error = %e, "[SESSION] Mount snapshot unavailable"),
        }
        session
    }

    /// Override the extension-request threshold (configuration knob).
    pub fn set_extension_threshold(&mut self, threshold: f64) {
        self.extension_threshold = threshold;
    }

    // -------------------------------------------------------------------------
    // Read model
    // -------------------------------------------------------------------------

    pub fn race_id(&self) -> &str {
        &self.race_id
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    pub fn machine(&self) -> &RaceMachine {
        &self.machine
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// The local typing tracker, present only while a race is bound.
    pub fn typing(&self) -> Option<&TypingTracker> {
        self.tracker.as_ref()
    }

    pub fn link(&self) -> LinkStatus {
        self.link
    }

    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    pub fn is_host(&self) -> bool {
        match (&self.self_id, self.roster.host_id()) {
            (Some(own), Some(host)) => own == host,
            _ => false,
        }
    }

    pub fn can_start(&self) -> bool {
        self.roster.can_start()
    }

    /// Terminal removed state: the server kicked this participant.
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn rematch_offer(&self) -> Option<&RematchOffer> {
        self.rematch.as_ref()
    }

    // -------------------------------------------------------------------------
    // Wire intake
    // -------------------------------------------------------------------------

    /// Drain the transport and apply everything, in delivery order.
    pub fn update<E, S, I>(
        &mut self,
        source: &mut E,
        sink: &mut S,
        store: &mut I,
        now: Instant,
    ) -> Vec<SessionEvent>
    where
        E: EventSource,
        S: IntentSink,
        I: IdentityStore,
    {
        let mut events = Vec::new();
        while let Some(item) = source.poll_event() {
            match item {
                WireEvent::Status(status) => self.handle_status(status, sink, &mut events),
                WireEvent::Envelope(envelope) => {
                    self.handle_envelope(envelope, sink, store, now, &mut events)
                }
                WireEvent::Fault(detail) => {
                    warn!(detail = %detail, "[SESSION] Transport fault");
                    events.push(SessionEvent::TransportFault(detail));
                }
            }
        }
        events
    }

    fn handle_status<S: IntentSink>(
        &mut self,
        status: LinkStatus,
        sink: &mut S,
        events: &mut Vec<SessionEvent>,
    ) {
        self.link = status;
        if status == LinkStatus::Connected {
            // Every reconnect drops the joined flag; the seat must be
            // re-claimed before any other intent means anything. A
            // kicked participant never re-claims it.
            self.joined = false;
            if !self.removed {
                self.send_join(sink, events);
            }
        }
        events.push(SessionEvent::ConnectionChanged(status));
    }

    fn send_join<S: IntentSink>(&mut self, sink: &mut S, events: &mut Vec<SessionEvent>) {
        let participant_id = self
            .identity
            .as_ref()
            .filter(|record| record.race_id == self.race_id)
            .map(|record| record.participant_id.clone());
        info!(
            race_id = %self.race_id,
            rejoin = participant_id.is_some(),
            "[SESSION] Joining race"
        );
        self.transmit(
            sink,
            Intent::Join {
                race_id: self.race_id.clone(),
                participant_id,
                name: Some(self.display_name.clone()),
            },
            events,
        );
    }

    fn handle_envelope<S, I>(
        &mut self,
        envelope: Event,
        sink: &mut S,
        store: &mut I,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) where
        S: IntentSink,
        I: IdentityStore,
    {
        match envelope {
            Event::Joined {
                race,
                participants,
                self_id,
                host_id,
                ready,
                locked,
            } => {
                self.machine.bind(race);
                self.roster.replace(participants);
                self.roster.set_host(Some(host_id));
                self.roster.replace_ready(ready);
                self.roster.set_locked(locked);
                self.adopt_self(self_id, store);
                self.joined = true;
                self.sync_race_timers(now);
                events.push(SessionEvent::Joined);
            }
            Event::ParticipantJoined { participant } => {
                self.roster.upsert(participant);
            }
            Event::ParticipantsSync {
                participants,
                host_id,
            } => {
                self.roster.replace(participants);
                if host_id.is_some() {
                    self.roster.set_host(host_id);
                }
            }
            Event::BotsAdded { bots } => {
                for bot in bots {
                    self.roster.upsert(bot);
                }
            }
            Event::CountdownStart { seconds } => {
                if self.machine.begin_countdown(seconds) {
                    self.timers
                        .arm_repeating(TimerKind::CountdownTick, now, COUNTDOWN_TICK);
                    events.push(SessionEvent::CountdownTick(seconds));
                }
            }
            Event::Countdown { seconds_left } => {
                self.machine.sync_countdown(seconds_left);
                if self.machine.phase() == Phase::Countdown {
                    events.push(SessionEvent::CountdownTick(seconds_left));
                }
            }
            Event::CountdownCancelled => {
                if self.machine.cancel_countdown() {
                    self.timers.cancel(TimerKind::CountdownTick);
                }
            }
            Event::RaceStart {
                text,
                started_at_ms,
                time_limit_ms,
            } => {
                if self
                    .machine
                    .begin_racing(text.as_deref(), Some(started_at_ms), time_limit_ms)
                {
                    self.timers.cancel(TimerKind::CountdownTick);
                    self.spawn_tracker(now);
                    events.push(SessionEvent::RaceStarted);
                }
            }
            Event::ParagraphExtended { text } => {
                self.machine.extend_text(&text);
                if let Some(tracker) = self.tracker.as_mut() {
                    tracker.extend_target(&text);
                }
            }
            Event::ProgressUpdate {
                id,
                chars_typed,
                wpm,
                accuracy,
                errors,
            } => {
                self.roster
                    .apply_progress(&id, chars_typed, wpm, accuracy, errors);
            }
            Event::ParticipantFinished {
                id,
                rank,
                wpm,
                accuracy,
                errors,
                chars_typed,
                elapsed_ms: _,
            } => {
                self.roster.patch(&id, |p| {
                    p.finished = true;
                    p.rank = Some(rank);
                    p.wpm = wpm;
                    p.accuracy = accuracy;
                    p.errors = errors;
                    p.chars_typed = chars_typed;
                });
            }
            Event::RaceFinished { standings } => {
                self.roster.apply_standings(&standings);
                if self.machine.finish_authoritative(standings) {
                    self.timers.cancel(TimerKind::ResultFallback);
                    self.timers.cancel(TimerKind::ElapsedTick);
                    sink.mark_race_over();
                    events.push(SessionEvent::ResultsPosted(ResultsSource::Authoritative));
                }
            }
            Event::ParticipantLeft { id } | Event::ParticipantRemoved { id } => {
                self.roster.remove(&id);
                if self.self_id.as_deref() == Some(id.as_str()) {
                    self.enter_removed(store, events);
                }
            }
            Event::ParticipantDisconnected { id } => {
                self.roster.mark_disconnected(&id);
            }
            Event::ParticipantReconnected { id } => {
                self.roster.mark_reconnected(&id);
            }
            Event::HostChanged { host_id } => {
                self.roster.set_host(Some(host_id));
            }
            Event::RematchAvailable { race_id, room_code } => {
                self.rematch = Some(RematchOffer {
                    race_id: race_id.clone(),
                    room_code: room_code.clone(),
                });
                events.push(SessionEvent::RematchOffered { race_id, room_code });
            }
            Event::ChatMessage {
                author_id,
                author_name,
                body,
                system,
                sent_at_ms,
            } => {
                let at = Utc
                    .timestamp_millis_opt(sent_at_ms as i64)
                    .single()
                    .unwrap_or_else(Utc::now);
                self.roster.push_chat(ChatEntry {
                    author_id,
                    author_name,
                    body,
                    system,
                    at,
                });
                events.push(SessionEvent::ChatReceived);
            }
            Event::RatingUpdate { id, rating, tier } => {
                self.roster.apply_rating(&id, rating, tier);
            }
            Event::ReadyStateUpdate { ready } => {
                self.roster.replace_ready(ready);
            }
            Event::ReadyStateChanged { id, ready } => {
                self.roster.set_ready(&id, ready);
            }
            Event::PlayerKicked { id } | Event::ParticipantKicked { id } => {
                self.roster.remove(&id);
                if self.self_id.as_deref() == Some(id.as_str()) {
                    self.enter_removed(store, events);
                }
            }
            Event::Kicked { reason } => {
                info!(reason = ?reason, "[SESSION] Kicked from race");
                self.enter_removed(store, events);
            }
            Event::RoomLockChanged { locked } => {
                self.roster.set_locked(locked);
            }
            Event::ServerShutdown { message } => {
                warn!(message = ?message, "[SESSION] Server shutdown announced");
                events.push(SessionEvent::ServerShutdown(message));
            }
            Event::ParticipantDnf { id } => {
                self.roster.mark_dnf(&id);
            }
            Event::Error { code, message } => {
                self.handle_rejection(code, message, sink, store, events);
            }
            Event::Unknown => {
                debug!("[SESSION] Unknown envelope dropped");
            }
        }
    }

    fn handle_rejection<S, I>(
        &mut self,
        code: ErrorCode,
        message: String,
        sink: &mut S,
        store: &mut I,
        events: &mut Vec<SessionEvent>,
    ) where
        S: IntentSink,
        I: IdentityStore,
    {
        match code {
            ErrorCode::NotInRace => {
                // The server lost track of our seat; one reconnect
                // (and the join that follows it) re-establishes it.
                if self.machine.phase() == Phase::Racing {
                    warn!("[SESSION] NOT_IN_RACE while racing, reconnecting");
                    sink.request_reconnect();
                }
                events.push(SessionEvent::Rejected { code, message });
            }
            ErrorCode::Kicked => {
                self.enter_removed(store, events);
            }
            _ => {
                debug!(code = code.as_code(), message = %message, "[SESSION] Server rejection");
                events.push(SessionEvent::Rejected { code, message });
            }
        }
    }

    fn enter_removed<I: IdentityStore>(&mut self, store: &mut I, events: &mut Vec<SessionEvent>) {
        if self.removed {
            return;
        }
        self.removed = true;
        self.timers.cancel_all();
        if let Err(e) = store.clear(&self.race_id) {
            warn!(error = %e, "[SESSION] Failed to clear identity record");
        }
        events.push(SessionEvent::Removed);
    }

    fn adopt_self<I: IdentityStore>(&mut self, self_id: String, store: &mut I) {
        let name = self
            .roster
            .get(&self_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| self.display_name.clone());
        let record = SelfRecord {
            race_id: self.race_id.clone(),
            participant_id: self_id.clone(),
            name,
        };
        if let Err(e) = store.save(&record) {
            warn!(error = %e, "[SESSION] Failed to persist identity record");
        }
        self.identity = Some(record);
        self.self_id = Some(self_id);
    }

    /// Adopt a REST snapshot (mount, or refetch of a finished race).
    pub fn adopt_snapshot(&mut self, snapshot: RaceSnapshot) {
        let RaceSnapshot {
            race,
            participants,
            host_id,
            ready,
            locked,
        } = snapshot;
        self.machine.bind(race);
        self.roster.replace(participants);
        self.roster.set_host(Some(host_id));
        self.roster.replace_ready(ready);
        self.roster.set_locked(locked);
        if let Some(record) = &self.identity {
            self.self_id = Some(record.participant_id.clone());
        }
    }

    /// Arm the timers a freshly bound race needs for its current phase.
    fn sync_race_timers(&mut self, now: Instant) {
        match self.machine.phase() {
            Phase::Countdown => {
                self.timers
                    .arm_repeating(TimerKind::CountdownTick, now, COUNTDOWN_TICK);
            }
            Phase::Racing => {
                // Joined (or rejoined) mid-race: rebuild the tracker
                // against the authoritative text.
                self.spawn_tracker(now);
            }
            _ => {}
        }
    }

    fn spawn_tracker(&mut self, now: Instant) {
        let Some(race) = self.machine.race() else {
            return;
        };
        let started_at = backdate(now, race.started_at_ms);
        self.tracker = Some(TypingTracker::new(
            &race.text,
            started_at,
            race.time_limit_ms.map(Duration::from_millis),
            race.supports_extension,
            self.extension_threshold,
        ));
        self.timers
            .arm_repeating(TimerKind::ElapsedTick, now, ELAPSED_TICK);
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    /// Service due timers. Call at frame rate (or at least every 100ms).
    pub fn poll<S: IntentSink>(&mut self, sink: &mut S, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for kind in self.timers.poll(now) {
            match kind {
                TimerKind::ElapsedTick => self.check_deadline(sink, now, &mut events),
                TimerKind::CountdownTick => {
                    if self.machine.phase() == Phase::Countdown {
                        let left = self.machine.countdown_tick_local();
                        events.push(SessionEvent::CountdownTick(left));
                    } else {
                        self.timers.cancel(TimerKind::CountdownTick);
                    }
                }
                TimerKind::ResultFallback => {
                    let estimate = self.roster.estimate_standings();
                    if self.machine.post_local_results(estimate) {
                        info!("[SESSION] Grace window expired, posting local estimate");
                        sink.mark_race_over();
                        events.push(SessionEvent::ResultsPosted(ResultsSource::LocalEstimate));
                    }
                }
            }
        }
        events
    }

    fn check_deadline<S: IntentSink>(
        &mut self,
        sink: &mut S,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        let Some(tracker) = self.tracker.as_mut() else {
            return;
        };
        if let Some(intent) = tracker.check_deadline(now) {
            self.transmit(sink, intent, events);
            self.finish_optimistically(now);
        }
    }

    /// Local finish (completion or timeout): flip the phase, stop the
    /// sampler and give the server one grace window to post standings
    /// before the local estimate goes up.
    fn finish_optimistically(&mut self, now: Instant) {
        if self.machine.finish_local() {
            self.timers.cancel(TimerKind::ElapsedTick);
            self.timers
                .arm_once(TimerKind::ResultFallback, now, RESULT_GRACE_WINDOW);
        }
    }

    // -------------------------------------------------------------------------
    // Typing input
    // -------------------------------------------------------------------------

    /// Feed one committed input event from the typing field.
    pub fn input<S: IntentSink>(
        &mut self,
        event: InputEvent,
        sink: &mut S,
        now: Instant,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.removed || self.machine.phase() != Phase::Racing {
            return events;
        }
        let Some(tracker) = self.tracker.as_mut() else {
            return events;
        };

        let outcome = tracker.apply(event, now);
        if let Some(rejection) = outcome.rejection {
            events.push(SessionEvent::InputRejected(rejection));
            return events;
        }

        // Mirror our own stats into the roster so the live board does
        // not wait for the server echo.
        let stats = tracker.stats(now);
        if let Some(id) = self.self_id.clone() {
            self.roster
                .apply_progress(&id, stats.chars_typed, stats.wpm, stats.accuracy, stats.errors);
        }

        for intent in outcome.intents {
            self.transmit(sink, intent, &mut events);
        }
        if outcome.finished {
            self.finish_optimistically(now);
        }
        events
    }

    // -------------------------------------------------------------------------
    // Local actions
    // -------------------------------------------------------------------------

    /// Host action: ask the server to start the race. Readiness is never
    /// flipped locally; the ready-state events reflect the outcome.
    pub fn request_start<S: IntentSink>(&mut self, sink: &mut S) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.transmit(sink, Intent::Ready, &mut events);
        events
    }

    /// Send a chat line, hard-capped at the protocol's message length.
    pub fn send_chat<S: IntentSink>(&mut self, sink: &mut S, body: &str) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let body: String = body.chars().take(MAX_CHAT_LEN).collect();
        if body.is_empty() {
            return events;
        }
        self.transmit(sink, Intent::ChatMessage { body }, &mut events);
        events
    }

    /// Host action: remove a participant.
    pub fn kick<S: IntentSink>(&mut self, sink: &mut S, participant_id: &str) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.transmit(
            sink,
            Intent::KickPlayer {
                participant_id: participant_id.to_string(),
            },
            &mut events,
        );
        events
    }

    /// Host action: lock or unlock the room. Display mirrors the
    /// `room_lock_changed` event; enforcement stays server-side.
    pub fn set_room_lock<S: IntentSink>(&mut self, sink: &mut S, locked: bool) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.transmit(sink, Intent::LockRoom { locked }, &mut events);
        events
    }

    /// Leave the race for good: tell the server and drop the seat record.
    pub fn leave<S, I>(&mut self, sink: &mut S, store: &mut I) -> Vec<SessionEvent>
    where
        S: IntentSink,
        I: IdentityStore,
    {
        let mut events = Vec::new();
        self.transmit(sink, Intent::Leave, &mut events);
        if let Err(e) = store.clear(&self.race_id) {
            warn!(error = %e, "[SESSION] Failed to clear identity record");
        }
        self.identity = None;
        events
    }

    /// Unmount the view: cancel every timer and close the connection
    /// cleanly, which discards pending intents and suppresses
    /// reconnection. A mid-race unmount still counts as a DNF
    /// server-side.
    pub fn unmount<S: IntentSink>(&mut self, sink: &mut S) {
        self.timers.cancel_all();
        sink.close();
        self.link = LinkStatus::Disconnected;
    }

    fn transmit<S: IntentSink>(
        &mut self,
        sink: &mut S,
        intent: Intent,
        events: &mut Vec<SessionEvent>,
    ) {
        if let Err(e) = sink.send(intent) {
            warn!(error = %e, "[SESSION] Failed to hand intent to transport");
            events.push(SessionEvent::TransportFault(e.to_string()));
        }
    }
}

/// Map the server's wall-clock start timestamp onto the local monotonic
/// clock, so a mid-race rejoin does not restart the elapsed counter.
fn backdate(now: Instant, started_at_ms: Option<u64>) -> Instant {
    let Some(started) = started_at_ms else {
        return now;
    };
    let wall_now = Utc::now().timestamp_millis().max(0) as u64;
    let elapsed = Duration::from_millis(wall_now.saturating_sub(started));
    now.checked_sub(elapsed).unwrap_or(now)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::core::identity::MemoryIdentityStore;
    use crate::core::io::mocks::{MemoryDirectory, RecordingSink, ScriptedSource};
    use crate::core::protocol::{Participant, RaceInfo, Standing, WirePhase};

    fn race_info() -> RaceInfo {
        RaceInfo {
            id: "race-1".to_string(),
            room_code: "QX7K".to_string(),
            text: "cat sat on the mat".to_string(),
            time_limit_ms: None,
            supports_extension: false,
            phase: WirePhase::Waiting,
            started_at_ms: None,
        }
    }

    fn participant(id: &str) -> Participant {
        Participant {
            id: id.to_string(),
            name: format!("player-{id}"),
            color: "#3182CE".to_string(),
            is_bot: false,
            chars_typed: 0,
            wpm: 0.0,
            accuracy: 100.0,
            errors: 0,
            finished: false,
            rank: None,
            disconnected: false,
            dnf: false,
            rating: None,
        }
    }

    fn joined_event() -> Event {
        Event::Joined {
            race: race_info(),
            participants: vec![participant("p-1"), participant("p-2")],
            self_id: "p-1".to_string(),
            host_id: "p-1".to_string(),
            ready: HashMap::new(),
            locked: false,
        }
    }

    fn standing(id: &str, rank: u32) -> Standing {
        Standing {
            id: id.to_string(),
            rank,
            wpm: 60.0,
            accuracy: 98.0,
            errors: 1,
            chars_typed: 18,
            dnf: false,
        }
    }

    struct Harness {
        session: RaceSession,
        source: ScriptedSource,
        sink: RecordingSink,
        store: MemoryIdentityStore,
        t0: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let store = MemoryIdentityStore::new();
            let directory = MemoryDirectory::default();
            let session = RaceSession::mount("race-1", "ada", &store, &directory);
            Self {
                session,
                source: ScriptedSource::new(),
                sink: RecordingSink::new(),
                store,
                t0: Instant::now(),
            }
        }

        fn update(&mut self) -> Vec<SessionEvent> {
            self.session
                .update(&mut self.source, &mut self.sink, &mut self.store, self.t0)
        }

        fn update_at(&mut self, now: Instant) -> Vec<SessionEvent> {
            self.session
                .update(&mut self.source, &mut self.sink, &mut self.store, now)
        }

        /// Connect and join the standard two-player waiting room.
        fn join(&mut self) {
            self.source.push_status(LinkStatus::Connected);
            self.source.push_envelope(joined_event());
            self.update();
        }

        /// Join and start racing.
        fn start_race(&mut self) {
            self.join();
            self.source.push_envelope(Event::RaceStart {
                text: None,
                started_at_ms: 1_700_000_000_000,
                time_limit_ms: None,
            });
            self.update();
        }

        fn type_str(&mut self, text: &str, now: Instant) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            for ch in text.chars() {
                events.extend(self.session.input(
                    InputEvent::Chars(ch.to_string()),
                    &mut self.sink,
                    now,
                ));
            }
            events
        }
    }

    // -------------------------------------------------------------------------
    // Join flow
    // -------------------------------------------------------------------------

    #[test]
    fn test_connect_sends_join_without_identity() {
        let mut h = Harness::new();
        h.source.push_status(LinkStatus::Connected);
        h.update();

        assert_eq!(h.sink.sent_kinds(), vec!["join"]);
        match &h.sink.sent[0] {
            Intent::Join {
                race_id,
                participant_id,
                name,
            } => {
                assert_eq!(race_id, "race-1");
                assert!(participant_id.is_none());
                assert_eq!(name.as_deref(), Some("ada"));
            }
            _ => panic!("Expected Join"),
        }
    }

    #[test]
    fn test_join_ack_builds_room_and_persists_seat() {
        let mut h = Harness::new();
        h.join();

        assert_eq!(h.session.phase(), Phase::Waiting);
        assert_eq!(h.session.roster().len(), 2);
        assert_eq!(h.session.self_id(), Some("p-1"));
        assert!(h.session.is_host());

        let record = current_record(&h.store, "race-1").unwrap();
        assert_eq!(record.participant_id, "p-1");
    }

    #[test]
    fn test_reconnect_rejoins_with_pinned_seat() {
        let mut h = Harness::new();
        h.join();

        // Drop and come back
        h.source.push_status(LinkStatus::Reconnecting);
        h.source.push_status(LinkStatus::Connected);
        h.update();

        assert_eq!(h.sink.count_kind("join"), 2);
        match h.sink.sent.last().unwrap() {
            Intent::Join { participant_id, .. } => {
                assert_eq!(participant_id.as_deref(), Some("p-1"));
            }
            _ => panic!("Expected Join"),
        }
    }

    #[test]
    fn test_stale_identity_is_ignored_at_mount() {
        let mut store = MemoryIdentityStore::new();
        store
            .save(&SelfRecord {
                race_id: "race-0".to_string(),
                participant_id: "p-9".to_string(),
                name: "ada".to_string(),
            })
            .unwrap();
        let directory = MemoryDirectory::default();
        let session = RaceSession::mount("race-1", "ada", &store, &directory);

        // The record names another race, so the next join is fresh
        assert!(session.self_id().is_none());
    }

    #[test]
    fn test_mount_adopts_finished_snapshot() {
        let store = MemoryIdentityStore::new();
        let mut race = race_info();
        race.phase = WirePhase::Finished;
        let directory = MemoryDirectory {
            snapshot: Some(RaceSnapshot {
                race,
                participants: vec![participant("p-1"), participant("p-2")],
                host_id: "p-2".to_string(),
                ready: HashMap::new(),
                locked: false,
            }),
            ..Default::default()
        };

        let session = RaceSession::mount("race-1", "ada", &store, &directory);
        assert_eq!(directory.fetch_calls.get(), 1);
        assert_eq!(session.phase(), Phase::Finished);
        assert_eq!(session.roster().len(), 2);
    }

    // -------------------------------------------------------------------------
    // Roster and room state
    // -------------------------------------------------------------------------

    #[test]
    fn test_roster_patches_apply_in_order() {
        let mut h = Harness::new();
        h.join();

        h.source.push_envelope(Event::ParticipantsSync {
            participants: vec![participant("p-1"), participant("p-2"), participant("p-3")],
            host_id: None,
        });
        h.source.push_envelope(Event::ProgressUpdate {
            id: "p-3".to_string(),
            chars_typed: 7,
            wpm: 30.0,
            accuracy: 100.0,
            errors: 0,
        });
        h.update();

        assert_eq!(h.session.roster().len(), 3);
        assert_eq!(h.session.roster().get("p-3").unwrap().chars_typed, 7);
    }

    #[test]
    fn test_duplicate_roster_sync_is_idempotent() {
        let mut h = Harness::new();
        h.join();

        let sync = Event::ParticipantsSync {
            participants: vec![participant("p-1"), participant("p-2")],
            host_id: Some("p-2".to_string()),
        };
        h.source.push_envelope(sync.clone());
        h.source.push_envelope(sync);
        h.update();

        assert_eq!(h.session.roster().len(), 2);
        assert_eq!(h.session.roster().host_id(), Some("p-2"));
    }

    #[test]
    fn test_can_start_needs_two_seats() {
        let mut h = Harness::new();
        h.source.push_status(LinkStatus::Connected);
        h.source.push_envelope(Event::Joined {
            race: race_info(),
            participants: vec![participant("p-1")],
            self_id: "p-1".to_string(),
            host_id: "p-1".to_string(),
            ready: HashMap::new(),
            locked: false,
        });
        h.update();
        assert!(!h.session.can_start());

        h.source.push_envelope(Event::ParticipantJoined {
            participant: participant("p-2"),
        });
        h.update();
        assert!(h.session.can_start());
    }

    #[test]
    fn test_host_change_and_lock_mirror() {
        let mut h = Harness::new();
        h.join();

        h.source.push_envelope(Event::HostChanged {
            host_id: "p-2".to_string(),
        });
        h.source.push_envelope(Event::RoomLockChanged { locked: true });
        h.update();

        assert!(!h.session.is_host());
        assert!(h.session.roster().locked());
    }

    #[test]
    fn test_kick_of_other_is_roster_removal() {
        let mut h = Harness::new();
        h.join();

        h.source.push_envelope(Event::ParticipantKicked {
            id: "p-2".to_string(),
        });
        let events = h.update();

        assert_eq!(h.session.roster().len(), 1);
        assert!(!h.session.is_removed());
        assert!(!events.contains(&SessionEvent::Removed));
    }

    #[test]
    fn test_kick_of_self_is_terminal() {
        let mut h = Harness::new();
        h.join();

        h.source.push_envelope(Event::Kicked { reason: None });
        let events = h.update();

        assert!(h.session.is_removed());
        assert!(events.contains(&SessionEvent::Removed));
        // Seat record is gone
        assert!(current_record(&h.store, "race-1").is_none());
    }

    #[test]
    fn test_removed_session_does_not_rejoin() {
        let mut h = Harness::new();
        h.join();
        h.source.push_envelope(Event::Kicked { reason: None });
        h.update();

        // The transport comes back; the kicked seat stays unclaimed
        h.source.push_status(LinkStatus::Connected);
        h.update();
        assert_eq!(h.sink.count_kind("join"), 1);
    }

    #[test]
    fn test_chat_appends_and_notifies() {
        let mut h = Harness::new();
        h.join();

        h.source.push_envelope(Event::ChatMessage {
            author_id: Some("p-2".to_string()),
            author_name: "player-p-2".to_string(),
            body: "gl hf".to_string(),
            system: false,
            sent_at_ms: 1_700_000_000_000,
        });
        let events = h.update();

        assert!(events.contains(&SessionEvent::ChatReceived));
        assert_eq!(h.session.roster().chat().len(), 1);
        assert_eq!(h.session.roster().chat()[0].body, "gl hf");
    }

    #[test]
    fn test_send_chat_respects_hard_cap() {
        let mut h = Harness::new();
        h.join();

        let long = "x".repeat(MAX_CHAT_LEN + 100);
        h.session.send_chat(&mut h.sink, &long);
        match h.sink.sent.last().unwrap() {
            Intent::ChatMessage { body } => assert_eq!(body.chars().count(), MAX_CHAT_LEN),
            _ => panic!("Expected ChatMessage"),
        }
    }

    // -------------------------------------------------------------------------
    // Countdown and race start
    // -------------------------------------------------------------------------

    #[test]
    fn test_countdown_flow() {
        let mut h = Harness::new();
        h.join();

        h.source.push_envelope(Event::CountdownStart { seconds: 3 });
        let events = h.update();
        assert_eq!(h.session.phase(), Phase::Countdown);
        assert!(events.contains(&SessionEvent::CountdownTick(3)));

        // Local tick counts down between server resyncs
        let events = h.session.poll(&mut h.sink, h.t0 + COUNTDOWN_TICK);
        assert!(events.contains(&SessionEvent::CountdownTick(2)));

        h.source.push_envelope(Event::CountdownCancelled);
        h.update();
        assert_eq!(h.session.phase(), Phase::Waiting);
    }

    #[test]
    fn test_duplicate_countdown_start_is_noop() {
        let mut h = Harness::new();
        h.join();
        h.source.push_envelope(Event::CountdownStart { seconds: 3 });
        h.source.push_envelope(Event::CountdownStart { seconds: 9 });
        h.update();
        assert_eq!(h.session.machine().countdown_remaining(), 3);
    }

    #[test]
    fn test_race_start_builds_tracker() {
        let mut h = Harness::new();
        h.start_race();

        assert_eq!(h.session.phase(), Phase::Racing);
        let tracker = h.session.typing().unwrap();
        assert_eq!(tracker.target_len(), "cat sat on the mat".chars().count());
        assert_eq!(tracker.index(), 0);
    }

    #[test]
    fn test_request_start_only_transmits() {
        let mut h = Harness::new();
        h.join();
        h.session.request_start(&mut h.sink);

        assert_eq!(h.sink.count_kind("ready"), 1);
        // No optimistic flip of anything
        assert_eq!(h.session.phase(), Phase::Waiting);
        assert!(!h.session.roster().is_ready("p-1"));
    }

    // -------------------------------------------------------------------------
    // Typing flow
    // -------------------------------------------------------------------------

    #[test]
    fn test_typing_emits_progress_and_mirrors_roster() {
        let mut h = Harness::new();
        h.start_race();
        let now = h.t0;

        h.type_str("cat", now);
        assert_eq!(h.sink.count_kind("progress"), 3);
        assert_eq!(h.session.roster().get("p-1").unwrap().chars_typed, 3);
    }

    #[test]
    fn test_full_completion_scenario() {
        // "cat sat" against "cat sat on the mat" would not complete, so
        // bind a race whose text is exactly "cat sat".
        let mut h = Harness::new();
        h.source.push_status(LinkStatus::Connected);
        let mut race = race_info();
        race.text = "cat sat".to_string();
        h.source.push_envelope(Event::Joined {
            race,
            participants: vec![participant("p-1"), participant("p-2")],
            self_id: "p-1".to_string(),
            host_id: "p-1".to_string(),
            ready: HashMap::new(),
            locked: false,
        });
        h.source.push_envelope(Event::RaceStart {
            text: None,
            started_at_ms: 1_700_000_000_000,
            time_limit_ms: None,
        });
        h.update();

        let now = h.t0;
        h.type_str("cat sab", now);
        h.session.input(InputEvent::Backspace, &mut h.sink, now);
        h.type_str("t", now);

        let tracker = h.session.typing().unwrap();
        assert_eq!(tracker.index(), 7);
        assert_eq!(tracker.errors(), 0);
        assert_eq!(h.sink.count_kind("finish"), 1);
        match h.sink.sent.last().unwrap() {
            Intent::Finish { chars_typed, errors, .. } => {
                assert_eq!(*chars_typed, 7);
                assert_eq!(*errors, 0);
            }
            _ => panic!("Expected Finish"),
        }
        assert_eq!(h.session.phase(), Phase::Finished);

        // Further input is inert and sends nothing
        let sent_before = h.sink.sent.len();
        h.session
            .input(InputEvent::Chars("x".to_string()), &mut h.sink, now);
        assert_eq!(h.sink.sent.len(), sent_before);
    }

    #[test]
    fn test_clipboard_rejection_surfaces_notice() {
        let mut h = Harness::new();
        h.start_race();

        let events = h.session.input(InputEvent::Paste, &mut h.sink, h.t0);
        assert!(events.contains(&SessionEvent::InputRejected(InputRejection::Clipboard)));
        assert_eq!(h.sink.count_kind("progress"), 0);
    }

    #[test]
    fn test_paragraph_extension_mid_race() {
        let mut h = Harness::new();
        h.start_race();
        h.type_str("cat", h.t0);

        h.source.push_envelope(Event::ParagraphExtended {
            text: " again".to_string(),
        });
        h.update();

        let tracker = h.session.typing().unwrap();
        assert_eq!(tracker.index(), 3);
        assert_eq!(
            tracker.target_len(),
            "cat sat on the mat again".chars().count()
        );
        assert!(h
            .session
            .machine()
            .race()
            .unwrap()
            .text
            .ends_with(" again"));
    }

    // -------------------------------------------------------------------------
    // Timed races
    // -------------------------------------------------------------------------

    fn start_timed_race(h: &mut Harness, limit_ms: u64) {
        h.join();
        h.source.push_envelope(Event::RaceStart {
            text: None,
            started_at_ms: Utc::now().timestamp_millis() as u64,
            time_limit_ms: Some(limit_ms),
        });
        h.update();
    }

    #[test]
    fn test_timeout_latch_stops_progress() {
        let mut h = Harness::new();
        start_timed_race(&mut h, 30_000);

        h.type_str("cat ", h.t0);
        let progress_before = h.sink.count_kind("progress");

        // Sampler observes the deadline
        h.session.poll(&mut h.sink, h.t0 + Duration::from_secs(31));
        assert_eq!(h.sink.count_kind("timed_finish"), 1);
        assert_eq!(h.session.phase(), Phase::Finished);

        // Later input sends no further progress
        let events = h.session.input(
            InputEvent::Chars("s".to_string()),
            &mut h.sink,
            h.t0 + Duration::from_secs(32),
        );
        assert_eq!(h.sink.count_kind("progress"), progress_before);
        assert_eq!(h.sink.count_kind("timed_finish"), 1);
        assert!(events.is_empty()); // phase is Finished, input path is closed
    }

    #[test]
    fn test_timed_finish_carries_frozen_stats() {
        let mut h = Harness::new();
        start_timed_race(&mut h, 30_000);
        h.type_str("cat sat", h.t0);

        h.session.poll(&mut h.sink, h.t0 + Duration::from_secs(30));
        match h
            .sink
            .sent
            .iter()
            .find(|i| i.kind() == "timed_finish")
            .unwrap()
        {
            Intent::TimedFinish { chars_typed, .. } => assert_eq!(*chars_typed, 7),
            _ => unreachable!(),
        }
    }

    // -------------------------------------------------------------------------
    // Finish and grace window
    // -------------------------------------------------------------------------

    #[test]
    fn test_authoritative_finish_within_grace_window() {
        let mut h = Harness::new();
        start_timed_race(&mut h, 30_000);
        h.type_str("cat", h.t0);

        // Timeout fires; the optimistic phase flip arms the fallback
        let deadline = h.t0 + Duration::from_secs(30);
        h.session.poll(&mut h.sink, deadline);
        assert_eq!(h.session.phase(), Phase::Finished);
        assert!(h.session.machine().results().is_none());

        // Authoritative standings land 400ms into the 1000ms window
        h.source.push_envelope(Event::RaceFinished {
            standings: vec![standing("p-1", 2), standing("p-2", 1)],
        });
        let events = h.update_at(deadline + Duration::from_millis(400));
        assert_eq!(
            events,
            vec![SessionEvent::ResultsPosted(ResultsSource::Authoritative)]
        );

        // The window expiring later changes nothing; no flicker back
        let events = h.session.poll(&mut h.sink, deadline + Duration::from_secs(2));
        assert!(events.is_empty());
        assert_eq!(
            h.session.machine().results().unwrap().source,
            ResultsSource::Authoritative
        );
    }

    #[test]
    fn test_grace_window_expiry_posts_estimate_then_authoritative_supersedes() {
        let mut h = Harness::new();
        start_timed_race(&mut h, 30_000);
        h.type_str("cat", h.t0);

        let deadline = h.t0 + Duration::from_secs(30);
        h.session.poll(&mut h.sink, deadline);

        // No authoritative message: the estimate goes up after 1s
        let events = h
            .session
            .poll(&mut h.sink, deadline + RESULT_GRACE_WINDOW);
        assert!(events.contains(&SessionEvent::ResultsPosted(ResultsSource::LocalEstimate)));

        // A slow authoritative message still replaces it, exactly once
        h.source.push_envelope(Event::RaceFinished {
            standings: vec![standing("p-1", 1), standing("p-2", 2)],
        });
        h.source.push_envelope(Event::RaceFinished {
            standings: vec![standing("p-1", 1), standing("p-2", 2)],
        });
        let events = h.update_at(deadline + Duration::from_secs(3));
        assert_eq!(
            events,
            vec![SessionEvent::ResultsPosted(ResultsSource::Authoritative)]
        );
        assert_eq!(h.session.machine().results().unwrap().standings.len(), 2);
    }

    #[test]
    fn test_posted_results_mark_transport_race_over() {
        let mut h = Harness::new();
        h.start_race();
        assert_eq!(h.sink.race_over_marks, 0);

        h.source.push_envelope(Event::RaceFinished {
            standings: vec![standing("p-1", 1), standing("p-2", 2)],
        });
        h.update();

        // From here a dirty socket drop stays down instead of reconnecting
        assert_eq!(h.sink.race_over_marks, 1);
    }

    #[test]
    fn test_local_estimate_also_marks_race_over() {
        let mut h = Harness::new();
        start_timed_race(&mut h, 30_000);
        h.type_str("cat", h.t0);

        let deadline = h.t0 + Duration::from_secs(30);
        h.session.poll(&mut h.sink, deadline);
        assert_eq!(h.sink.race_over_marks, 0);

        h.session.poll(&mut h.sink, deadline + RESULT_GRACE_WINDOW);
        assert_eq!(h.sink.race_over_marks, 1);
    }

    #[test]
    fn test_race_finished_writes_roster_standings() {
        let mut h = Harness::new();
        h.start_race();

        h.source.push_envelope(Event::RaceFinished {
            standings: vec![standing("p-2", 1), standing("p-1", 2)],
        });
        h.update();

        let p2 = h.session.roster().get("p-2").unwrap();
        assert!(p2.finished);
        assert_eq!(p2.rank, Some(1));
    }

    // -------------------------------------------------------------------------
    // Error envelopes
    // -------------------------------------------------------------------------

    #[test]
    fn test_not_in_race_while_racing_reconnects_once() {
        let mut h = Harness::new();
        h.start_race();

        h.source.push_envelope(Event::Error {
            code: ErrorCode::NotInRace,
            message: "unknown participant".to_string(),
        });
        h.update();
        assert_eq!(h.sink.reconnect_requests, 1);
    }

    #[test]
    fn test_not_in_race_outside_racing_is_notice_only() {
        let mut h = Harness::new();
        h.join();

        h.source.push_envelope(Event::Error {
            code: ErrorCode::NotInRace,
            message: "unknown participant".to_string(),
        });
        let events = h.update();
        assert_eq!(h.sink.reconnect_requests, 0);
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Rejected {
                code: ErrorCode::NotInRace,
                ..
            }]
        ));
    }

    #[test]
    fn test_unknown_rejection_code_surfaces_message() {
        let mut h = Harness::new();
        h.join();

        h.source.push_envelope(Event::Error {
            code: ErrorCode::Unknown,
            message: "tournament bracket closed".to_string(),
        });
        let events = h.update();
        match &events[0] {
            SessionEvent::Rejected { code, message } => {
                assert_eq!(*code, ErrorCode::Unknown);
                assert_eq!(message, "tournament bracket closed");
            }
            other => panic!("Expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn test_server_shutdown_is_a_notice() {
        let mut h = Harness::new();
        h.join();
        h.source.push_envelope(Event::ServerShutdown {
            message: Some("maintenance".to_string()),
        });
        let events = h.update();
        assert!(events.contains(&SessionEvent::ServerShutdown(Some(
            "maintenance".to_string()
        ))));
    }

    // -------------------------------------------------------------------------
    // Rematch and teardown
    // -------------------------------------------------------------------------

    #[test]
    fn test_rematch_offer_lands_in_read_model() {
        let mut h = Harness::new();
        h.join();
        h.source.push_envelope(Event::RematchAvailable {
            race_id: "race-2".to_string(),
            room_code: "RED-OWL".to_string(),
        });
        h.update();
        assert_eq!(h.session.rematch_offer().unwrap().race_id, "race-2");
    }

    #[test]
    fn test_leave_clears_identity() {
        let mut h = Harness::new();
        h.join();
        assert!(current_record(&h.store, "race-1").is_some());

        h.session.leave(&mut h.sink, &mut h.store);
        assert_eq!(h.sink.count_kind("leave"), 1);
        assert!(current_record(&h.store, "race-1").is_none());
    }

    #[test]
    fn test_unmount_closes_and_silences_timers() {
        let mut h = Harness::new();
        h.start_race();

        h.session.unmount(&mut h.sink);
        assert_eq!(h.sink.close_calls, 1);

        // No timer fires afterwards, no matter how late the poll
        let events = h.session.poll(&mut h.sink, h.t0 + Duration::from_secs(600));
        assert!(events.is_empty());
    }

    #[test]
    fn test_transport_fault_surfaces_banner() {
        let mut h = Harness::new();
        h.join();
        h.source
            .push(WireEvent::Fault("connection reset".to_string()));
        let events = h.update();
        assert!(events.contains(&SessionEvent::TransportFault(
            "connection reset".to_string()
        )));
    }
}
