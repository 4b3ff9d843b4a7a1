//! Race wire protocol
//!
//! JSON message types exchanged with the race server, plus the REST
//! snapshot shapes. Every websocket envelope is an object tagged by a
//! string `type` field. These types are platform-independent; the codec
//! helpers at the bottom are the only entry points the transport uses.

use std::collections::HashMap;

use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};

use crate::core::error::ProtocolError;

// =============================================================================
// DATA TYPES
// =============================================================================

/// Race lifecycle phase as carried on the wire.
///
/// The client-only `idle` phase (mounted but not yet joined) never
/// appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WirePhase {
    #[default]
    Waiting,
    Countdown,
    Racing,
    Finished,
}

/// Authoritative description of a race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceInfo {
    pub id: String,
    pub room_code: String,
    /// Full target paragraph at the time of the message.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    /// Whether the server will append text on request near the end.
    #[serde(default)]
    pub supports_extension: bool,
    #[serde(default)]
    pub phase: WirePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
}

/// One seat in the race, human or bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    /// Display color as "#RRGGBB"; normalized on roster ingest.
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub chars_typed: u32,
    #[serde(default)]
    pub wpm: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    #[serde(default)]
    pub disconnected: bool,
    /// Did not finish (left or was removed mid-race).
    #[serde(default)]
    pub dnf: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<RatingSnapshot>,
}

/// Competitive rating attached to a participant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingSnapshot {
    pub rating: i32,
    /// Numeric tier bucket; see [`RatingTier`].
    pub tier: u8,
}

impl RatingSnapshot {
    /// Display label for the tier bucket; out-of-range buckets render
    /// as unranked.
    pub fn tier_label(&self) -> &'static str {
        RatingTier::from_tier(self.tier)
            .map(|tier| tier.label())
            .unwrap_or("Unranked")
    }
}

/// Named rating tiers for the numeric buckets the server sends.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum RatingTier {
    Bronze = 1,
    Silver = 2,
    Gold = 3,
    Platinum = 4,
    Diamond = 5,
    Master = 6,
}

impl RatingTier {
    /// Match a wire tier bucket; out-of-range buckets display as unranked.
    pub fn from_tier(tier: u8) -> Option<Self> {
        Self::try_from(tier).ok()
    }

    pub fn label(&self) -> &'static str {
        match self {
            RatingTier::Bronze => "Bronze",
            RatingTier::Silver => "Silver",
            RatingTier::Gold => "Gold",
            RatingTier::Platinum => "Platinum",
            RatingTier::Diamond => "Diamond",
            RatingTier::Master => "Master",
        }
    }
}

/// Final placement row carried by `race_finished`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    pub id: String,
    pub rank: u32,
    pub wpm: f64,
    pub accuracy: f64,
    pub errors: u32,
    pub chars_typed: u32,
    #[serde(default)]
    pub dnf: bool,
}

/// Closed set of server rejection codes. Unrecognized codes map to
/// [`ErrorCode::Unknown`] and the free-text message is surfaced instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    NotHost,
    NotEnoughPlayers,
    PlayersNotReady,
    RoomLocked,
    RaceFull,
    RaceStarted,
    RaceFinished,
    RateLimited,
    InvalidPayload,
    NotInRace,
    Kicked,
    Unknown,
}

impl ErrorCode {
    pub fn from_code(raw: &str) -> Self {
        match raw {
            "NOT_HOST" => ErrorCode::NotHost,
            "NOT_ENOUGH_PLAYERS" => ErrorCode::NotEnoughPlayers,
            "PLAYERS_NOT_READY" => ErrorCode::PlayersNotReady,
            "ROOM_LOCKED" => ErrorCode::RoomLocked,
            "RACE_FULL" => ErrorCode::RaceFull,
            "RACE_STARTED" => ErrorCode::RaceStarted,
            "RACE_FINISHED" => ErrorCode::RaceFinished,
            "RATE_LIMITED" => ErrorCode::RateLimited,
            "INVALID_PAYLOAD" => ErrorCode::InvalidPayload,
            "NOT_IN_RACE" => ErrorCode::NotInRace,
            "KICKED" => ErrorCode::Kicked,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            ErrorCode::NotHost => "NOT_HOST",
            ErrorCode::NotEnoughPlayers => "NOT_ENOUGH_PLAYERS",
            ErrorCode::PlayersNotReady => "PLAYERS_NOT_READY",
            ErrorCode::RoomLocked => "ROOM_LOCKED",
            ErrorCode::RaceFull => "RACE_FULL",
            ErrorCode::RaceStarted => "RACE_STARTED",
            ErrorCode::RaceFinished => "RACE_FINISHED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::NotInRace => "NOT_IN_RACE",
            ErrorCode::Kicked => "KICKED",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl From<String> for ErrorCode {
    fn from(raw: String) -> Self {
        ErrorCode::from_code(&raw)
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_code().to_string()
    }
}

// =============================================================================
// INTENTS (client → server)
// =============================================================================

/// Messages sent to the race server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    /// Enter a race; `participant_id` pins an existing seat on rejoin.
    Join {
        race_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Request race start (host action).
    Ready,
    /// Live progress after a local buffer mutation.
    Progress {
        chars_typed: u32,
        wpm: f64,
        accuracy: f64,
        errors: u32,
    },
    /// Local buffer reached the end of the target text.
    Finish {
        chars_typed: u32,
        wpm: f64,
        accuracy: f64,
        errors: u32,
        elapsed_ms: u64,
    },
    /// Time limit expired locally; stats are frozen at expiry.
    TimedFinish {
        chars_typed: u32,
        wpm: f64,
        accuracy: f64,
        errors: u32,
    },
    /// Ask for more paragraph text (near the end of the current target).
    ExtendParagraph,
    ChatMessage { body: String },
    Leave,
    /// Host action: remove a participant from the room.
    KickPlayer { participant_id: String },
    /// Host action: lock or unlock the room to new joins.
    LockRoom { locked: bool },
}

impl Intent {
    /// Wire tag of this intent, for logs and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Intent::Join { .. } => "join",
            Intent::Ready => "ready",
            Intent::Progress { .. } => "progress",
            Intent::Finish { .. } => "finish",
            Intent::TimedFinish { .. } => "timed_finish",
            Intent::ExtendParagraph => "extend_paragraph",
            Intent::ChatMessage { .. } => "chat_message",
            Intent::Leave => "leave",
            Intent::KickPlayer { .. } => "kick_player",
            Intent::LockRoom { .. } => "lock_room",
        }
    }
}

// =============================================================================
// EVENTS (server → client)
// =============================================================================

/// Messages received from the race server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Join acknowledged: the full room state plus our seat.
    Joined {
        race: RaceInfo,
        participants: Vec<Participant>,
        self_id: String,
        host_id: String,
        #[serde(default)]
        ready: HashMap<String, bool>,
        #[serde(default)]
        locked: bool,
    },
    ParticipantJoined { participant: Participant },
    /// Full roster replace; host rides along when it changed too.
    ParticipantsSync {
        participants: Vec<Participant>,
        #[serde(default)]
        host_id: Option<String>,
    },
    BotsAdded { bots: Vec<Participant> },
    CountdownStart { seconds: u32 },
    /// Server-driven countdown resync tick.
    Countdown { seconds_left: u32 },
    CountdownCancelled,
    RaceStart {
        /// Final target text; omitted when unchanged since `joined`.
        #[serde(default)]
        text: Option<String>,
        started_at_ms: u64,
        #[serde(default)]
        time_limit_ms: Option<u64>,
    },
    /// More target text appended mid-race.
    ParagraphExtended { text: String },
    ProgressUpdate {
        id: String,
        chars_typed: u32,
        wpm: f64,
        accuracy: f64,
        errors: u32,
    },
    ParticipantFinished {
        id: String,
        rank: u32,
        wpm: f64,
        accuracy: f64,
        errors: u32,
        chars_typed: u32,
        elapsed_ms: u64,
    },
    /// Authoritative end of the race with final placements.
    RaceFinished { standings: Vec<Standing> },
    ParticipantLeft { id: String },
    ParticipantRemoved { id: String },
    ParticipantDisconnected { id: String },
    ParticipantReconnected { id: String },
    HostChanged { host_id: String },
    /// A follow-up race exists for this room.
    RematchAvailable { race_id: String, room_code: String },
    ChatMessage {
        #[serde(default)]
        author_id: Option<String>,
        author_name: String,
        body: String,
        #[serde(default)]
        system: bool,
        sent_at_ms: u64,
    },
    RatingUpdate { id: String, rating: i32, tier: u8 },
    /// Full ready-map replace.
    ReadyStateUpdate { ready: HashMap<String, bool> },
    /// Single ready flip.
    ReadyStateChanged { id: String, ready: bool },
    /// Legacy alias of `participant_kicked`.
    PlayerKicked { id: String },
    ParticipantKicked { id: String },
    /// Directed form: the local participant was kicked.
    Kicked {
        #[serde(default)]
        reason: Option<String>,
    },
    RoomLockChanged { locked: bool },
    ServerShutdown {
        #[serde(default)]
        message: Option<String>,
    },
    ParticipantDnf { id: String },
    Error { code: ErrorCode, message: String },
    /// Forward-compatibility catch-all; logged and dropped at dispatch.
    #[serde(other)]
    Unknown,
}

impl Event {
    /// Wire tag of this event, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Joined { .. } => "joined",
            Event::ParticipantJoined { .. } => "participant_joined",
            Event::ParticipantsSync { .. } => "participants_sync",
            Event::BotsAdded { .. } => "bots_added",
            Event::CountdownStart { .. } => "countdown_start",
            Event::Countdown { .. } => "countdown",
            Event::CountdownCancelled => "countdown_cancelled",
            Event::RaceStart { .. } => "race_start",
            Event::ParagraphExtended { .. } => "paragraph_extended",
            Event::ProgressUpdate { .. } => "progress_update",
            Event::ParticipantFinished { .. } => "participant_finished",
            Event::RaceFinished { .. } => "race_finished",
            Event::ParticipantLeft { .. } => "participant_left",
            Event::ParticipantRemoved { .. } => "participant_removed",
            Event::ParticipantDisconnected { .. } => "participant_disconnected",
            Event::ParticipantReconnected { .. } => "participant_reconnected",
            Event::HostChanged { .. } => "host_changed",
            Event::RematchAvailable { .. } => "rematch_available",
            Event::ChatMessage { .. } => "chat_message",
            Event::RatingUpdate { .. } => "rating_update",
            Event::ReadyStateUpdate { .. } => "ready_state_update",
            Event::ReadyStateChanged { .. } => "ready_state_changed",
            Event::PlayerKicked { .. } => "player_kicked",
            Event::ParticipantKicked { .. } => "participant_kicked",
            Event::Kicked { .. } => "kicked",
            Event::RoomLockChanged { .. } => "room_lock_changed",
            Event::ServerShutdown { .. } => "server_shutdown",
            Event::ParticipantDnf { .. } => "participant_dnf",
            Event::Error { .. } => "error",
            Event::Unknown => "unknown",
        }
    }
}

// =============================================================================
// REST SHAPES
// =============================================================================

/// `GET /races/{id}` response: everything needed to (re)build the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceSnapshot {
    pub race: RaceInfo,
    pub participants: Vec<Participant>,
    pub host_id: String,
    #[serde(default)]
    pub ready: HashMap<String, bool>,
    #[serde(default)]
    pub locked: bool,
}

/// `POST /races/quick-match` response: the next race and our seat in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickMatch {
    pub race_id: String,
    pub room_code: String,
    pub participant: Participant,
}

// =============================================================================
// CODEC
// =============================================================================

/// Serialize an intent for the wire.
pub fn encode_intent(intent: &Intent) -> Result<String, ProtocolError> {
    serde_json::to_string(intent).map_err(ProtocolError::Encode)
}

/// Decode one inbound envelope.
///
/// Unknown kinds come back as [`ProtocolError::UnknownKind`] so the caller
/// can log the tag and move on; they are never fatal.
pub fn decode_event(raw: &str) -> Result<Event, ProtocolError> {
    let event: Event = serde_json::from_str(raw).map_err(|source| ProtocolError::Malformed {
        kind: probe_kind(raw),
        source,
    })?;
    if let Event::Unknown = event {
        return Err(ProtocolError::UnknownKind {
            kind: probe_kind(raw).unwrap_or_else(|| "<missing>".to_string()),
        });
    }
    Ok(event)
}

/// Best-effort extraction of the `type` tag, for log lines.
fn probe_kind(raw: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(rename = "type")]
        kind: Option<String>,
    }
    serde_json::from_str::<Probe>(raw).ok().and_then(|p| p.kind)
}

// =============================================================================
// TESTS
// =============================================================================
