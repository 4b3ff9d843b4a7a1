//! Room roster
//!
//! The authoritative view of who is in the room: participants with
//! their live stats, the host, per-participant ready flags, the room
//! lock and the chat log. Everything here mirrors server messages;
//! patches aimed at an id we do not know are dropped, a later full
//! sync reconciles.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::constants::MIN_RACE_PARTICIPANTS;
use crate::core::protocol::{Participant, RatingSnapshot, Standing};

// =============================================================================
// CHAT
// =============================================================================

/// One chat line, server broadcast or local echo.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    /// Missing for system lines.
    pub author_id: Option<String>,
    pub author_name: String,
    pub body: String,
    pub system: bool,
    pub at: DateTime<Utc>,
}

// =============================================================================
// COLORS
// =============================================================================

const FALLBACK_PALETTE: [&str; 8] = [
    "#E74C3C", "#3498DB", "#2ECC71", "#F39C12", "#9B59B6", "#1ABC9C", "#E91E63", "#16A085",
];

fn is_valid_hex(color: &str) -> bool {
    match color.strip_prefix('#') {
        Some(hex) => hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

fn palette_slot(id: &str) -> usize {
    let folded = id
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    folded % FALLBACK_PALETTE.len()
}

/// Uppercase a valid "#RRGGBB", or pick a stable palette color by id.
fn normalize_color(participant: &mut Participant) {
    if is_valid_hex(&participant.color) {
        participant.color = participant.color.to_uppercase();
    } else {
        participant.color = FALLBACK_PALETTE[palette_slot(&participant.id)].to_string();
    }
}

// =============================================================================
// ROSTER
// =============================================================================

/// Participants, host, ready flags, room lock and chat for one room.
#[derive(Debug, Default)]
pub struct Roster {
    participants: Vec<Participant>,
    host_id: Option<String>,
    ready: HashMap<String, bool>,
    locked: bool,
    chat: Vec<ChatEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Full roster replacement (`joined`, `participants_sync`, snapshot
    /// refetch). Applying the same list twice lands on the same state.
    pub fn replace(&mut self, participants: Vec<Participant>) {
        self.participants = participants;
        for participant in &mut self.participants {
            normalize_color(participant);
        }
        self.ready.retain(|id, _| self.participants.iter().any(|p| &p.id == id));
    }

    /// Insert or overwrite one participant by id.
    pub fn upsert(&mut self, mut participant: Participant) {
        normalize_color(&mut participant);
        match self.participants.iter_mut().find(|p| p.id == participant.id) {
            Some(slot) => *slot = participant,
            None => self.participants.push(participant),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        self.ready.remove(id);
        let pos = self.participants.iter().position(|p| p.id == id)?;
        Some(self.participants.remove(pos))
    }

    /// Apply `mutate` to the participant with this id. An unknown id is
    /// a no-op, not an error.
    pub fn patch<F>(&mut self, id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Participant),
    {
        match self.participants.iter_mut().find(|p| p.id == id) {
            Some(participant) => {
                mutate(participant);
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Host / lock / ready
    // -------------------------------------------------------------------------

    pub fn set_host(&mut self, host_id: Option<String>) {
        self.host_id = host_id;
    }

    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Full ready-map replace.
    pub fn replace_ready(&mut self, ready: HashMap<String, bool>) {
        self.ready = ready;
    }

    /// Single ready flip.
    pub fn set_ready(&mut self, id: &str, ready: bool) {
        self.ready.insert(id.to_string(), ready);
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.ready.get(id).copied().unwrap_or(false)
    }

    /// Whether a start request can succeed: at least two seats filled,
    /// bots included. The server still has the final word.
    pub fn can_start(&self) -> bool {
        self.participants.len() >= MIN_RACE_PARTICIPANTS
    }

    // -------------------------------------------------------------------------
    // Stat write-through
    // -------------------------------------------------------------------------

    pub fn apply_progress(
        &mut self,
        id: &str,
        chars_typed: u32,
        wpm: f64,
        accuracy: f64,
        errors: u32,
    ) -> bool {
        self.patch(id, |p| {
            p.chars_typed = chars_typed;
            p.wpm = wpm;
            p.accuracy = accuracy;
            p.errors = errors;
        })
    }

    /// Write one final standing into its participant.
    pub fn apply_standing(&mut self, standing: &Standing) -> bool {
        self.patch(&standing.id, |p| {
            p.chars_typed = standing.chars_typed;
            p.wpm = standing.wpm;
            p.accuracy = standing.accuracy;
            p.errors = standing.errors;
            p.rank = Some(standing.rank);
            p.finished = !standing.dnf;
            p.dnf = standing.dnf;
        })
    }

    pub fn apply_standings(&mut self, standings: &[Standing]) {
        for standing in standings {
            self.apply_standing(standing);
        }
    }

    pub fn mark_disconnected(&mut self, id: &str) -> bool {
        self.patch(id, |p| p.disconnected = true)
    }

    pub fn mark_reconnected(&mut self, id: &str) -> bool {
        self.patch(id, |p| p.disconnected = false)
    }

    pub fn mark_dnf(&mut self, id: &str) -> bool {
        self.patch(id, |p| p.dnf = true)
    }

    pub fn apply_rating(&mut self, id: &str, rating: i32, tier: u8) -> bool {
        let snapshot = RatingSnapshot { rating, tier };
        debug!(id, rating, tier = snapshot.tier_label(), "[ROSTER] Rating updated");
        self.patch(id, |p| p.rating = Some(snapshot))
    }

    // -------------------------------------------------------------------------
    // Chat
    // -------------------------------------------------------------------------

    pub fn push_chat(&mut self, entry: ChatEntry) {
        self.chat.push(entry);
    }

    pub fn chat(&self) -> &[ChatEntry] {
        &self.chat
    }

    // -------------------------------------------------------------------------
    // Ordering
    // -------------------------------------------------------------------------

    /// Leaderboard order: finished participants by rank, then everyone
    /// still typing by chars typed, descending.
    pub fn standings(&self) -> Vec<&Participant> {
        let mut ordered: Vec<&Participant> = self.participants.iter().collect();
        ordered.sort_by(|a, b| match (a.finished, b.finished) {
            (true, true) => a.rank.unwrap_or(u32::MAX).cmp(&b.rank.unwrap_or(u32::MAX)),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => b.chars_typed.cmp(&a.chars_typed),
        });
        ordered
    }

    /// Standings assembled from the live stats, for the fallback board
    /// when the server's final message has not arrived.
    pub fn estimate_standings(&self) -> Vec<Standing> {
        self.standings()
            .iter()
            .enumerate()
            .map(|(pos, p)| Standing {
                id: p.id.clone(),
                rank: p.rank.unwrap_or(pos as u32 + 1),
                wpm: p.wpm,
                accuracy: p.accuracy,
                errors: p.errors,
                chars_typed: p.chars_typed,
                dnf: p.dnf,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: &str) -> Participant {
        Participant {
            id: id.to_string(),
            name: format!("player-{id}"),
            color: "#aabbcc".to_string(),
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

    fn bot(id: &str) -> Participant {
        Participant {
            is_bot: true,
            ..participant(id)
        }
    }

    #[test]
    fn test_replace_is_idempotent() {
        let mut roster = Roster::new();
        let list = vec![participant("a"), participant("b")];

        roster.replace(list.clone());
        let first: Vec<Participant> = roster.participants().to_vec();

        roster.replace(list);
        assert_eq!(roster.participants(), first.as_slice());
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_replace_drops_ready_for_missing_ids() {
        let mut roster = Roster::new();
        roster.replace(vec![participant("a"), participant("b")]);
        roster.set_ready("a", true);
        roster.set_ready("b", true);

        roster.replace(vec![participant("a")]);
        assert!(roster.is_ready("a"));
        assert!(!roster.is_ready("b"));
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut roster = Roster::new();
        roster.upsert(participant("a"));

        let mut updated = participant("a");
        updated.name = "renamed".to_string();
        roster.upsert(updated);

        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get("a").unwrap().name, "renamed");
    }

    #[test]
    fn test_patch_unknown_id_is_noop() {
        let mut roster = Roster::new();
        roster.replace(vec![participant("a")]);

        assert!(!roster.apply_progress("ghost", 10, 50.0, 99.0, 1));
        assert_eq!(roster.get("a").unwrap().chars_typed, 0);
    }

    #[test]
    fn test_progress_write_through() {
        let mut roster = Roster::new();
        roster.replace(vec![participant("a")]);

        assert!(roster.apply_progress("a", 42, 61.5, 97.0, 2));
        let p = roster.get("a").unwrap();
        assert_eq!(p.chars_typed, 42);
        assert_eq!(p.errors, 2);
        assert!((p.wpm - 61.5).abs() < 1e-9);
    }

    #[test]
    fn test_remove_clears_ready_flag() {
        let mut roster = Roster::new();
        roster.replace(vec![participant("a"), participant("b")]);
        roster.set_ready("b", true);

        let removed = roster.remove("b").unwrap();
        assert_eq!(removed.id, "b");
        assert_eq!(roster.len(), 1);
        assert!(!roster.is_ready("b"));
        assert!(roster.remove("b").is_none());
    }

    #[test]
    fn test_can_start_counts_bots() {
        let mut roster = Roster::new();
        roster.replace(vec![participant("human")]);
        assert!(!roster.can_start());

        roster.upsert(bot("bot-1"));
        assert!(roster.can_start());
    }

    #[test]
    fn test_ready_defaults_to_false() {
        let mut roster = Roster::new();
        roster.replace(vec![participant("a")]);
        assert!(!roster.is_ready("a"));

        roster.replace_ready(HashMap::from([("a".to_string(), true)]));
        assert!(roster.is_ready("a"));

        roster.set_ready("a", false);
        assert!(!roster.is_ready("a"));
    }

    #[test]
    fn test_color_normalization() {
        let mut roster = Roster::new();
        let mut lower = participant("a");
        lower.color = "#ff00aa".to_string();
        let mut junk = participant("b");
        junk.color = "blue".to_string();
        roster.replace(vec![lower, junk]);

        assert_eq!(roster.get("a").unwrap().color, "#FF00AA");
        let fallback = roster.get("b").unwrap().color.clone();
        assert!(FALLBACK_PALETTE.contains(&fallback.as_str()));

        // Same id always lands on the same palette slot
        let mut again = participant("b");
        again.color = String::new();
        roster.upsert(again);
        assert_eq!(roster.get("b").unwrap().color, fallback);
    }

    #[test]
    fn test_standings_order() {
        let mut roster = Roster::new();
        let mut winner = participant("winner");
        winner.finished = true;
        winner.rank = Some(1);
        let mut second = participant("second");
        second.finished = true;
        second.rank = Some(2);
        let mut ahead = participant("ahead");
        ahead.chars_typed = 80;
        let mut behind = participant("behind");
        behind.chars_typed = 30;
        roster.replace(vec![behind, second, ahead, winner]);

        let order: Vec<&str> = roster.standings().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["winner", "second", "ahead", "behind"]);
    }

    #[test]
    fn test_apply_standings_writes_through() {
        let mut roster = Roster::new();
        roster.replace(vec![participant("a"), participant("b")]);

        roster.apply_standings(&[
            Standing {
                id: "a".to_string(),
                rank: 1,
                wpm: 80.0,
                accuracy: 99.0,
                errors: 1,
                chars_typed: 120,
                dnf: false,
            },
            Standing {
                id: "b".to_string(),
                rank: 2,
                wpm: 20.0,
                accuracy: 90.0,
                errors: 5,
                chars_typed: 40,
                dnf: true,
            },
        ]);

        let a = roster.get("a").unwrap();
        assert!(a.finished);
        assert_eq!(a.rank, Some(1));

        let b = roster.get("b").unwrap();
        assert!(!b.finished);
        assert!(b.dnf);
        assert_eq!(b.rank, Some(2));
    }

    #[test]
    fn test_estimate_standings_ranks_by_order() {
        let mut roster = Roster::new();
        let mut done = participant("done");
        done.finished = true;
        done.rank = Some(1);
        done.wpm = 70.0;
        let mut typing = participant("typing");
        typing.chars_typed = 55;
        roster.replace(vec![typing, done]);

        let estimate = roster.estimate_standings();
        assert_eq!(estimate[0].id, "done");
        assert_eq!(estimate[0].rank, 1);
        assert_eq!(estimate[1].id, "typing");
        assert_eq!(estimate[1].rank, 2);
        assert_eq!(estimate[1].chars_typed, 55);
    }

    #[test]
    fn test_disconnect_and_reconnect_flags() {
        let mut roster = Roster::new();
        roster.replace(vec![participant("a")]);

        assert!(roster.mark_disconnected("a"));
        assert!(roster.get("a").unwrap().disconnected);

        assert!(roster.mark_reconnected("a"));
        assert!(!roster.get("a").unwrap().disconnected);
    }

    #[test]
    fn test_rating_write_through() {
        let mut roster = Roster::new();
        roster.replace(vec![participant("a")]);

        assert!(roster.apply_rating("a", 1480, 3));
        let rating = roster.get("a").unwrap().rating.as_ref().unwrap();
        assert_eq!(rating.rating, 1480);
        assert_eq!(rating.tier, 3);
    }

    #[test]
    fn test_chat_appends_in_order() {
        let mut roster = Roster::new();
        for body in ["first", "second"] {
            roster.push_chat(ChatEntry {
                author_id: Some("a".to_string()),
                author_name: "player-a".to_string(),
                body: body.to_string(),
                system: false,
                at: Utc::now(),
            });
        }
        let bodies: Vec<&str> = roster.chat().iter().map(|c| c.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);
    }
}
