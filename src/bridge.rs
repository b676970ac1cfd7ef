//! Periodic persistence of live rooms and reaping of expired state.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::PersistenceError;
use crate::persistence::RoomRepository;
use crate::room::Room;
use crate::session;
use crate::state::AppState;

pub async fn flush_room(repository: &dyn RoomRepository, room: &Room) -> Result<(), PersistenceError> {
    repository.upsert_room(&room.id, room.to_update()).await
}

/// One pass over every live room.
///
/// Expired rooms are torn down. Everything else is flushed, and rooms with
/// nobody left in them are dropped from memory once their flush succeeds.
/// Afterwards, environments that sat unused past the idle TTL and whose
/// room is no longer in memory are removed.
pub async fn tick(state: &AppState) {
    let now = Utc::now();
    let mut flushed = 0usize;
    for id in state.rooms.ids().await {
        let Some(room) = state.rooms.get(&id).await else {
            continue;
        };

        if room.is_expired(now) {
            session::teardown_room(state, room, "This room has expired").await;
            continue;
        }

        match flush_room(state.repository.as_ref(), &room).await {
            Ok(()) => {
                flushed += 1;
                if room.is_empty() {
                    state.rooms.release(room).await;
                }
            }
            Err(e) => warn!(room = %id, error = %e, "auto-save failed, retrying next tick"),
        }
    }
    if flushed > 0 {
        debug!(rooms = flushed, "rooms flushed");
    }

    let ttl = state.config.env_idle_ttl;
    for room in state.sandbox.idle_environments(ttl).await {
        if state.rooms.contains(&room).await {
            continue;
        }
        if state.sandbox.reap_if_idle(&room, ttl).await {
            info!(room = %room, "removed idle execution environment");
        }
    }
}

/// Spawns the flush loop on `state.config.flush_interval`.
pub fn spawn_flush_loop(state: AppState) -> JoinHandle<()> {
    let period = state.config.flush_interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tick(&state).await;
        }
    })
}
