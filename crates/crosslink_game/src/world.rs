//! # World Clock
//!
//! In-game time shared by every subsystem, held in a [`SyncedState`].
//! Advancing is a reversible delta; every commit is announced on the bus as
//! [`GameEvent::WorldTick`]. Merging a clock from another source keeps the
//! later of the two times.

use std::sync::{Arc, Weak};

use crosslink_core::{EventBus, SnapshotStamp, StateDelta, SyncedState};

use crate::capabilities::WorldCapability;
use crate::error::{GameError, GameResult};
use crate::events::GameEvent;
use crate::GameContext;

/// Hours in an in-game day.
pub const HOURS_PER_DAY: u8 = 24;

/// A point in world time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorldTime {
    /// Hours elapsed since the world started.
    pub tick: u64,
    /// Day number.
    pub day: u32,
    /// Hour of the day.
    pub hour: u8,
}

impl WorldTime {
    /// Time `tick` hours after the start.
    ///
    /// # Errors
    ///
    /// `ArithmeticOverflow` past day `u32::MAX`.
    pub fn from_tick(tick: u64) -> GameResult<Self> {
        let per_day = u64::from(HOURS_PER_DAY);
        let day = u32::try_from(tick / per_day).map_err(|_| GameError::ArithmeticOverflow)?;
        let hour = u8::try_from(tick % per_day).map_err(|_| GameError::ArithmeticOverflow)?;
        Ok(Self { tick, day, hour })
    }

    /// Whether `day` and `hour` agree with `tick`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        Self::from_tick(self.tick).is_ok_and(|t| t == *self)
    }
}

/// Moves the clock forward by a number of hours.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvanceHours(pub u64);

impl StateDelta<WorldTime> for AdvanceHours {
    fn apply(&self, state: &mut WorldTime) -> Result<(), String> {
        let tick = state
            .tick
            .checked_add(self.0)
            .ok_or_else(|| "world clock overflow".to_owned())?;
        *state = WorldTime::from_tick(tick).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn revert(&self, state: &mut WorldTime) {
        if let Ok(previous) = WorldTime::from_tick(state.tick.saturating_sub(self.0)) {
            *state = previous;
        }
    }

    fn describe(&self) -> String {
        format!("advance {}h", self.0)
    }
}

/// The shared clock.
pub struct WorldClock {
    state: SyncedState<WorldTime>,
}

impl WorldClock {
    /// Starts the clock at tick 0 and registers it as [`WorldCapability`].
    pub fn install(ctx: &GameContext) -> Arc<Self> {
        let state = ctx
            .synced_state("world.time")
            .with_initial(WorldTime::default())
            .with_pre_validator(|time: &WorldTime| {
                if time.hour >= HOURS_PER_DAY {
                    return Err(format!("hour {} out of range", time.hour));
                }
                if !time.is_consistent() {
                    return Err(format!(
                        "day {} hour {} disagree with tick {}",
                        time.day, time.hour, time.tick
                    ));
                }
                Ok(())
            })
            .with_conflict_resolver(|current: &WorldTime, proposed: &WorldTime| {
                if proposed.tick >= current.tick {
                    *proposed
                } else {
                    *current
                }
            });

        let bus: Weak<EventBus<GameEvent>> = Arc::downgrade(ctx.bus());
        state.register_observer(move |time: &WorldTime| {
            if let Some(bus) = bus.upgrade() {
                bus.publish(GameEvent::WorldTick {
                    tick: time.tick,
                    day: time.day,
                    hour: time.hour,
                });
            }
        });

        let clock = Arc::new(Self { state });
        let provider: Arc<dyn WorldCapability> = clock.clone();
        ctx.registry().register(provider);
        clock
    }

    /// Advances the clock. Returns the new time.
    ///
    /// # Errors
    ///
    /// `Integration(ValidationRejected)` on overflow.
    pub fn advance(&self, hours: u64) -> GameResult<WorldTime> {
        self.state.apply_delta(&AdvanceHours(hours))?;
        Ok(self.now())
    }

    /// Version of the committed time.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.version()
    }

    /// Merges a time observed at `base_version` from elsewhere. If the clock
    /// moved since, the later of the two times wins.
    ///
    /// # Errors
    ///
    /// `Integration(ValidationRejected)` if `remote` is malformed.
    pub fn merge(&self, base_version: u64, remote: WorldTime) -> GameResult<u64> {
        Ok(self.state.set_state_at(base_version, remote)?)
    }

    /// Records the current time under a label.
    ///
    /// # Errors
    ///
    /// Never in practice; the clock always holds a value.
    pub fn checkpoint(&self, label: &str) -> GameResult<SnapshotStamp> {
        Ok(self.state.create_snapshot(label)?)
    }

    /// Returns the clock to a checkpoint.
    ///
    /// # Errors
    ///
    /// `Integration(SnapshotNotFound)` if the checkpoint was evicted.
    pub fn rewind(&self, stamp: SnapshotStamp) -> GameResult<WorldTime> {
        self.state.restore_snapshot(stamp)?;
        Ok(self.now())
    }
}

impl WorldCapability for WorldClock {
    fn now(&self) -> WorldTime {
        self.state.get().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosslink_core::IntegrationError;
    use parking_lot::Mutex;

    use crate::events::EventKind;

    fn clock() -> (GameContext, Arc<WorldClock>) {
        let ctx = GameContext::builder().build().unwrap();
        let clock = WorldClock::install(&ctx);
        (ctx, clock)
    }

    #[test]
    fn test_advance_rolls_over_days() {
        let (_ctx, clock) = clock();
        let time = clock.advance(30).unwrap();
        assert_eq!(time, WorldTime { tick: 30, day: 1, hour: 6 });
        assert_eq!(clock.version(), 2);
    }

    #[test]
    fn test_commits_publish_world_ticks() {
        let (ctx, clock) = clock();
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&ticks);
        let _sub = ctx.bus().subscribe(EventKind::WorldTick, move |env| {
            if let GameEvent::WorldTick { tick, .. } = env.payload() {
                seen.lock().push(*tick);
            }
            Ok(())
        });

        clock.advance(1).unwrap();
        clock.advance(5).unwrap();

        assert_eq!(*ticks.lock(), vec![1, 6]);
    }

    #[test]
    fn test_malformed_remote_time_rejected() {
        let (_ctx, clock) = clock();
        let base = clock.version();

        let result = clock.merge(base, WorldTime { tick: 5, day: 0, hour: 30 });

        assert!(matches!(
            result,
            Err(GameError::Integration(IntegrationError::ValidationRejected { .. }))
        ));
        assert_eq!(clock.now(), WorldTime::default());
    }

    #[test]
    fn test_stale_merge_keeps_later_time() {
        let (_ctx, clock) = clock();
        let base = clock.version();
        clock.advance(10).unwrap();

        clock.merge(base, WorldTime::from_tick(4).unwrap()).unwrap();

        assert_eq!(clock.now().tick, 10);
    }

    #[test]
    fn test_rewind_to_checkpoint() {
        let (_ctx, clock) = clock();
        clock.advance(3).unwrap();
        let stamp = clock.checkpoint("before storm").unwrap();
        clock.advance(48).unwrap();

        let time = clock.rewind(stamp).unwrap();

        assert_eq!(time.tick, 3);
        assert_eq!(clock.version(), 4);
    }

    #[test]
    fn test_delta_revert_restores_time() {
        let mut time = WorldTime::from_tick(20).unwrap();
        let delta = AdvanceHours(7);
        delta.apply(&mut time).unwrap();
        assert_eq!(time, WorldTime { tick: 27, day: 1, hour: 3 });
        delta.revert(&mut time);
        assert_eq!(time, WorldTime::from_tick(20).unwrap());
    }
}
