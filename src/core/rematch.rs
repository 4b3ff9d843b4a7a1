//! Rematch coordinator
//!
//! A finished room can roll into a fresh race. The server may announce
//! one (`rematch_available`, recorded on the session read model), or the
//! client can create one through the quick-match endpoint. Either way
//! the consumer tears the old view down and mounts a new session with
//! the ticket below; nothing carries over in memory.

use tracing::{info, warn};

use crate::core::error::DirectoryError;
use crate::core::identity::SelfRecord;
use crate::core::io::{IdentityStore, RaceDirectory};

/// A follow-up race announced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RematchOffer {
    pub race_id: String,
    pub room_code: String,
}

/// Everything needed to mount a session on the next race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTicket {
    pub race_id: String,
    pub room_code: String,
    pub participant_id: String,
}

/// Create a rematch race and persist the new seat, so the fresh session
/// rejoins with a pinned participant id even through a reload.
///
/// A failed identity write is not fatal; the join ack re-saves the same
/// record.
pub fn request_quick_match<D, S>(
    directory: &D,
    store: &mut S,
) -> Result<MountTicket, DirectoryError>
where
    D: RaceDirectory,
    S: IdentityStore,
{
    let quick = directory.quick_match()?;
    info!(
        race_id = %quick.race_id,
        room_code = %quick.room_code,
        "[REMATCH] Quick-match race created"
    );

    let record = SelfRecord {
        race_id: quick.race_id.clone(),
        participant_id: quick.participant.id.clone(),
        name: quick.participant.name.clone(),
    };
    if let Err(e) = store.save(&record) {
        warn!(error = %e, "[REMATCH] Failed to persist new seat record");
    }

    Ok(MountTicket {
        race_id: quick.race_id,
        room_code: quick.room_code,
        participant_id: quick.participant.id,
    })
}
