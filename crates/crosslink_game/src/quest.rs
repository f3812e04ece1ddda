//! # Quests
//!
//! Collection quests driven entirely by bus traffic: buying items advances
//! the buyer's accepted quests for that item. Completion pays the reward
//! through whichever provider holds [`EconomyCapability`], keyed per player
//! and quest so a reward is never paid twice.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Weak};

use crosslink_core::{CapabilityRegistry, EventBus, HandlerError, HandlerResult, Subscription};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::capabilities::{resolve, EconomyCapability, QuestCapability};
use crate::error::{GameError, GameResult};
use crate::events::{EventKind, GameEvent, ItemId, PlayerId, QuestId};
use crate::GameContext;

/// A "collect N of item X" quest.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Quest {
    /// Quest id.
    pub id: QuestId,
    /// Display name.
    pub name: String,
    /// Item to collect.
    pub item_id: ItemId,
    /// Items needed.
    pub target: u32,
    /// Gold paid on completion.
    #[serde(default)]
    pub reward: u64,
}

#[derive(Deserialize)]
struct QuestFile {
    quests: Vec<Quest>,
}

/// Parses `[[quests]]` tables.
///
/// # Errors
///
/// `InvalidCatalog` on malformed TOML, a zero target or duplicate ids.
pub fn quests_from_toml_str(source: &str) -> GameResult<Vec<Quest>> {
    let file: QuestFile =
        toml::from_str(source).map_err(|e| GameError::InvalidCatalog(e.to_string()))?;
    let mut seen = HashSet::new();
    for quest in &file.quests {
        if quest.target == 0 {
            return Err(GameError::InvalidCatalog(format!("{}: target is 0", quest.name)));
        }
        if !seen.insert(quest.id) {
            return Err(GameError::InvalidCatalog(format!("duplicate quest id {}", quest.id)));
        }
    }
    Ok(file.quests)
}

/// Loads a quest file.
///
/// # Errors
///
/// `InvalidCatalog` if the file cannot be read or parsed.
pub fn load_quests(path: impl AsRef<Path>) -> GameResult<Vec<Quest>> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)
        .map_err(|e| GameError::InvalidCatalog(format!("{}: {e}", path.display())))?;
    quests_from_toml_str(&source)
}

/// Tracks accepted quests per player.
pub struct QuestTracker {
    quests: HashMap<QuestId, Quest>,
    progress: Mutex<HashMap<(PlayerId, QuestId), u32>>,
    registry: Weak<CapabilityRegistry>,
    bus: Arc<EventBus<GameEvent>>,
    _trades: Subscription<GameEvent>,
}

impl QuestTracker {
    /// Creates the tracker, registers it as [`QuestCapability`] and
    /// subscribes to trades.
    pub fn install(ctx: &GameContext, quests: Vec<Quest>) -> Arc<Self> {
        let tracker = Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            let trades = ctx.bus().subscribe(EventKind::ItemTraded, move |envelope| {
                match this.upgrade() {
                    Some(tracker) => tracker.on_event(envelope.payload()),
                    None => Ok(()),
                }
            });
            Self {
                quests: quests.into_iter().map(|q| (q.id, q)).collect(),
                progress: Mutex::new(HashMap::new()),
                registry: Arc::downgrade(ctx.registry()),
                bus: Arc::clone(ctx.bus()),
                _trades: trades,
            }
        });

        let provider: Arc<dyn QuestCapability> = tracker.clone();
        ctx.registry().register(provider);
        tracker
    }

    /// Starts `quest_id` for `player`. Returns `false` if already accepted.
    ///
    /// # Errors
    ///
    /// `InvalidCatalog` if the quest does not exist.
    pub fn accept(&self, player: PlayerId, quest_id: QuestId) -> GameResult<bool> {
        if !self.quests.contains_key(&quest_id) {
            return Err(GameError::InvalidCatalog(format!("unknown quest {quest_id}")));
        }
        let mut progress = self.progress.lock();
        if progress.contains_key(&(player, quest_id)) {
            return Ok(false);
        }
        progress.insert((player, quest_id), 0);
        Ok(true)
    }

    fn on_event(&self, event: &GameEvent) -> HandlerResult {
        let GameEvent::ItemTraded {
            buyer,
            item_id,
            count,
            ..
        } = *event
        else {
            return Ok(());
        };

        let mut updates = Vec::new();
        {
            let mut progress = self.progress.lock();
            for quest in self.quests.values().filter(|q| q.item_id == item_id) {
                let Some(current) = progress.get_mut(&(buyer, quest.id)) else {
                    continue;
                };
                if *current >= quest.target {
                    continue;
                }
                *current = current.saturating_add(count).min(quest.target);
                updates.push((quest.clone(), *current));
            }
        }

        updates.sort_by_key(|(quest, _)| quest.id);

        // Every update is published even when a reward fails.
        let mut failures = Vec::new();
        for (quest, progress) in updates {
            let completed = progress >= quest.target;
            if completed && quest.reward > 0 {
                if let Err(err) = self.pay_reward(buyer, &quest) {
                    failures.push(format!("quest {} reward: {err}", quest.id));
                }
            }
            tracing::debug!(
                player = buyer,
                quest = quest.id,
                progress,
                completed,
                "quest progress"
            );
            self.bus.publish(GameEvent::QuestUpdated {
                player: buyer,
                quest_id: quest.id,
                progress,
                completed,
            });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HandlerError(failures.join("; ")))
        }
    }

    fn pay_reward(&self, player: PlayerId, quest: &Quest) -> GameResult<()> {
        let economy = resolve::<dyn EconomyCapability>(&self.registry)?;
        let key = format!("quest-{}-player-{player}", quest.id);
        economy.grant(player, quest.reward, Some(&key))?;
        Ok(())
    }
}

impl QuestCapability for QuestTracker {
    fn progress(&self, player: PlayerId, quest_id: QuestId) -> Option<u32> {
        self.progress.lock().get(&(player, quest_id)).copied()
    }

    fn is_completed(&self, player: PlayerId, quest_id: QuestId) -> bool {
        let Some(quest) = self.quests.get(&quest_id) else {
            return false;
        };
        self.progress(player, quest_id)
            .is_some_and(|p| p >= quest.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosslink_core::MemorySink;

    const QUESTS: &str = r#"
        [[quests]]
        id = 10
        name = "Miner's Apprentice"
        item_id = 1
        target = 5
        reward = 50
    "#;

    fn trade(buyer: PlayerId, count: u32) -> GameEvent {
        GameEvent::ItemTraded {
            seller: 99,
            buyer,
            item_id: 1,
            count,
            price: 0,
        }
    }

    #[test]
    fn test_quests_parse() {
        let quests = quests_from_toml_str(QUESTS).unwrap();
        assert_eq!(quests.len(), 1);
        assert_eq!(quests[0].reward, 50);
        let zero_target = "[[quests]]\nid = 1\nname = \"x\"\nitem_id = 1\ntarget = 0\n";
        assert!(quests_from_toml_str(zero_target).is_err());
    }

    #[test]
    fn test_progress_only_for_accepted_quests() {
        let ctx = GameContext::builder().build().unwrap();
        let tracker = QuestTracker::install(&ctx, quests_from_toml_str(QUESTS).unwrap());

        ctx.bus().publish(trade(1, 2));
        assert_eq!(tracker.progress(1, 10), None);

        assert!(tracker.accept(1, 10).unwrap());
        assert!(!tracker.accept(1, 10).unwrap());
        ctx.bus().publish(trade(1, 2));
        assert_eq!(tracker.progress(1, 10), Some(2));
        assert!(!tracker.is_completed(1, 10));
    }

    #[test]
    fn test_completion_without_economy_is_handler_failure() {
        let sink = Arc::new(MemorySink::new());
        let ctx = GameContext::builder().sink(sink.clone()).build().unwrap();
        let tracker = QuestTracker::install(&ctx, quests_from_toml_str(QUESTS).unwrap());
        tracker.accept(1, 10).unwrap();

        let outcome = ctx.bus().publish(trade(1, 9));

        assert!(tracker.is_completed(1, 10));
        assert_eq!(tracker.progress(1, 10), Some(5));
        match outcome {
            crosslink_core::PublishOutcome::Delivered(report) => {
                assert_eq!(report.failures.len(), 1);
            }
            crosslink_core::PublishOutcome::Dropped { .. } => panic!("trade dropped"),
        }
    }

    #[test]
    fn test_failed_reward_does_not_hide_other_quests() {
        let quests = vec![
            Quest {
                id: 1,
                name: "Paid".into(),
                item_id: 1,
                target: 3,
                reward: 50,
            },
            Quest {
                id: 2,
                name: "Unpaid".into(),
                item_id: 1,
                target: 3,
                reward: 0,
            },
        ];
        let ctx = GameContext::builder().build().unwrap();
        let tracker = QuestTracker::install(&ctx, quests);
        tracker.accept(1, 1).unwrap();
        tracker.accept(1, 2).unwrap();

        let updates = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&updates);
        let _sub = ctx.bus().subscribe(EventKind::QuestUpdated, move |env| {
            if let GameEvent::QuestUpdated { quest_id, completed, .. } = *env.payload() {
                seen.lock().push((quest_id, completed));
            }
            Ok(())
        });

        // No economy registered: quest 1 cannot pay out.
        let outcome = ctx.bus().publish(trade(1, 3));

        assert_eq!(*updates.lock(), vec![(1, true), (2, true)]);
        let crosslink_core::PublishOutcome::Delivered(report) = outcome else {
            panic!("trade dropped");
        };
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.0.contains("quest 1 reward"));
    }

    #[test]
    fn test_dropped_tracker_unsubscribes() {
        let ctx = GameContext::builder().build().unwrap();
        let tracker = QuestTracker::install(&ctx, Vec::new());
        assert_eq!(ctx.bus().subscriber_count(EventKind::ItemTraded), 1);

        ctx.registry().unregister::<dyn QuestCapability>();
        drop(tracker);

        assert_eq!(ctx.bus().subscriber_count(EventKind::ItemTraded), 0);
    }
}
