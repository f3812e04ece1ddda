//! Cross-system scenarios: subsystems that only know each other through
//! capabilities, events and requests.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crosslink_core::{IntegrationConfig, IntegrationError, MemorySink};
use crosslink_game::{
    quests_from_toml_str, EconomyCapability, EventKind, GameContext, GameError, GameEvent,
    GameRequest, GameResult, GameWorld, InventoryCapability, ItemCatalog, ItemId, PlayerId,
    QuestCapability,
};
use parking_lot::Mutex;

const CATALOG: &str = r#"
    [[items]]
    id = 1
    name = "Iron Ore"
    max_stack = 64
    base_price = 5

    [[items]]
    id = 3
    name = "Health Potion"
    max_stack = 16
    base_price = 25
"#;

const QUESTS: &str = r#"
    [[quests]]
    id = 1
    name = "Miner's Apprentice"
    item_id = 1
    target = 10
    reward = 60
"#;

fn setup_with(config: IntegrationConfig) -> (GameContext, GameWorld, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let ctx = GameContext::builder()
        .config(config)
        .sink(sink.clone())
        .build()
        .unwrap();
    let world = GameWorld::install(
        &ctx,
        ItemCatalog::from_toml_str(CATALOG).unwrap(),
        quests_from_toml_str(QUESTS).unwrap(),
    );
    (ctx, world, sink)
}

fn setup() -> (GameContext, GameWorld, Arc<MemorySink>) {
    setup_with(IntegrationConfig::default())
}

#[test]
fn test_trades_drive_quest_and_reward_once() {
    let (ctx, world, _sink) = setup();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&updates);
    let _sub = ctx.bus().subscribe(EventKind::QuestUpdated, move |env| {
        seen.lock().push(env.payload().clone());
        Ok(())
    });

    world.inventory.give(1, 1, 30, None).unwrap();
    world.economy.grant(2, 100, None).unwrap();
    world.quests.accept(2, 1).unwrap();

    world.economy.trade(1, 2, 1, 6, "t-1").unwrap();
    world.economy.trade(1, 2, 1, 6, "t-2").unwrap();
    // Replay of an already settled trade: no event, no progress, no reward.
    world.economy.trade(1, 2, 1, 6, "t-2").unwrap();
    world.economy.trade(1, 2, 1, 6, "t-3").unwrap();

    assert!(world.quests.is_completed(2, 1));
    assert_eq!(world.quests.progress(2, 1), Some(10));
    // 100 - 3 * 30 + 60 reward
    assert_eq!(world.economy.balance(2), 70);
    assert_eq!(world.inventory.count(2, 1), 18);
    assert_eq!(
        *updates.lock(),
        vec![
            GameEvent::QuestUpdated {
                player: 2,
                quest_id: 1,
                progress: 6,
                completed: false
            },
            GameEvent::QuestUpdated {
                player: 2,
                quest_id: 1,
                progress: 10,
                completed: true
            },
        ]
    );
}

#[test]
fn test_concurrent_trades_conserve_gold_and_items() {
    let (_ctx, world, _sink) = setup();
    let world = Arc::new(world);
    for seller in 0..4u32 {
        world.inventory.give(seller, 1, 200, None).unwrap();
    }
    for buyer in 10..14u32 {
        world.economy.grant(buyer, 1_000, None).unwrap();
    }

    let workers: Vec<_> = (0..4u32)
        .map(|i| {
            let world = Arc::clone(&world);
            thread::spawn(move || {
                for n in 0..25u32 {
                    let key = format!("w{i}-{n}");
                    world.economy.trade(i, 10 + (n % 4), 1, 2, &key).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(world.economy.total_supply(), 4_000);
    let held: u32 = (0..4u32)
        .chain(10..14u32)
        .map(|p| world.inventory.count(p, 1))
        .sum();
    assert_eq!(held, 800);
    assert_eq!(world.economy.trade_book().settled, 100);
    assert_eq!(world.economy.trade_book().volume, 1_000);
}

#[test]
fn test_same_key_from_many_threads_settles_once() {
    let (ctx, world, _sink) = setup();
    let world = Arc::new(world);
    world.inventory.give(1, 1, 50, None).unwrap();
    world.economy.grant(2, 500, None).unwrap();

    let trades = Arc::new(Mutex::new(0u32));
    let counted = Arc::clone(&trades);
    let _sub = ctx.bus().subscribe(EventKind::ItemTraded, move |_| {
        *counted.lock() += 1;
        Ok(())
    });

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let world = Arc::clone(&world);
            thread::spawn(move || world.economy.trade(1, 2, 1, 10, "checkout-7").unwrap())
        })
        .collect();
    let receipts: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert!(receipts.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(world.inventory.count(2, 1), 10);
    assert_eq!(world.economy.balance(2), 450);
    assert_eq!(*trades.lock(), 1);
}

/// An inventory whose item moves always fail.
struct JammedInventory;

impl InventoryCapability for JammedInventory {
    fn count(&self, _: PlayerId, _: ItemId) -> u32 {
        0
    }

    fn give(&self, _: PlayerId, _: ItemId, _: u32, _: Option<&str>) -> GameResult<u32> {
        Err(GameError::InventoryFull { capacity: 0, amount: 1 })
    }

    fn take(&self, _: PlayerId, item_id: ItemId, count: u32, _: Option<&str>) -> GameResult<u32> {
        Err(GameError::InsufficientItems {
            item_id,
            required: count,
            available: 0,
        })
    }

    fn transfer(
        &self,
        _: PlayerId,
        _: PlayerId,
        _: ItemId,
        _: u32,
        _: Option<&str>,
    ) -> GameResult<()> {
        Err(GameError::InventoryFull { capacity: 0, amount: 1 })
    }
}

#[test]
fn test_replaced_provider_is_used_and_trade_refunded() {
    let (ctx, world, _sink) = setup();
    world.inventory.give(1, 1, 10, None).unwrap();
    world.economy.grant(2, 100, None).unwrap();

    let jammed: Arc<dyn InventoryCapability> = Arc::new(JammedInventory);
    let previous = ctx.registry().register(jammed);
    assert!(previous.is_some());

    let result = world.economy.trade(1, 2, 1, 2, "t-1");

    assert!(matches!(result, Err(GameError::InventoryFull { .. })));
    assert_eq!(world.economy.balance(2), 100);
    assert_eq!(world.economy.balance(1), 0);
    assert_eq!(world.inventory.count(1, 1), 10);
}

#[test]
fn test_request_to_removed_subsystem_times_out() {
    let mut config = IntegrationConfig::default();
    config.requests.timeout_ms = 50;
    config.requests.sweep_interval_ms = 10;
    let (ctx, world, sink) = setup_with(config);
    let sweeper = ctx.spawn_sweeper().unwrap();

    ctx.registry().unregister::<dyn EconomyCapability>();
    ctx.registry().unregister::<dyn InventoryCapability>();
    ctx.registry().unregister::<dyn QuestCapability>();
    drop(world);

    let handle = ctx
        .broker()
        .request(GameRequest::Balance { player: 1 })
        .unwrap();
    let result = handle.wait_timeout(Duration::from_secs(2));

    assert!(matches!(result, Err(IntegrationError::RequestTimedOut(_))));
    assert_eq!(ctx.broker().pending_count(), 0);
    assert!(sink.metric_total("requests.timed_out") >= 1.0);
    sweeper.stop();
}

#[test]
fn test_world_ticks_reach_subscribers() {
    let (ctx, world, _sink) = setup();
    let days = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&days);
    let _sub = ctx.bus().subscribe(EventKind::WorldTick, move |env| {
        if let GameEvent::WorldTick { day, .. } = env.payload() {
            seen.lock().push(*day);
        }
        Ok(())
    });

    world.clock.advance(12).unwrap();
    world.clock.advance(12).unwrap();
    world.clock.advance(25).unwrap();

    assert_eq!(*days.lock(), vec![0, 1, 2]);
}

#[test]
fn test_rolled_back_trades_are_journaled() {
    let (ctx, world, sink) = setup();
    world.inventory.give(1, 1, 1, None).unwrap();
    world.economy.grant(2, 100, None).unwrap();

    assert!(world.economy.trade(1, 2, 1, 5, "t-1").is_err());

    let rolled_back: Vec<_> = ctx
        .journal()
        .records()
        .into_iter()
        .filter(|r| r.status == crosslink_core::TxStatus::RolledBack)
        .map(|r| (r.target, r.operation))
        .collect();
    // The trade opens first and closes last around the inner item move.
    assert_eq!(
        rolled_back,
        vec![
            ("trades".to_owned(), "trade".to_owned()),
            ("inventory".to_owned(), "transfer".to_owned()),
        ]
    );
    assert_eq!(world.economy.balance(2), 100);
    assert_eq!(sink.logs_with_status("rolled back").len(), 2);
}
