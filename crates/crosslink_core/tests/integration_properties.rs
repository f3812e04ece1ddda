//! # Integration Framework Properties
//!
//! End-to-end checks of the guarantees the framework promises to its
//! subsystems, run through a fully wired `IntegrationContext`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crosslink_core::diagnostics::status;
use crosslink_core::{
    BusEvent, DeliveryStatus, IntegrationConfig, IntegrationContext, IntegrationError, LogLevel,
    MemorySink, RequestEnvelope, RetryPolicy, Rollback, Subscription, TxRequest, TxStatus,
};

// ============================================================================
// Fixture
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Damage(u32),
    Loot(String),
    Ask(RequestEnvelope<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Kind {
    Damage,
    Loot,
    Ask,
}

impl BusEvent for Event {
    type Kind = Kind;

    fn kind(&self) -> Kind {
        match self {
            Self::Damage(_) => Kind::Damage,
            Self::Loot(_) => Kind::Loot,
            Self::Ask(_) => Kind::Ask,
        }
    }
}

impl From<RequestEnvelope<String>> for Event {
    fn from(env: RequestEnvelope<String>) -> Self {
        Self::Ask(env)
    }
}

type Ctx = IntegrationContext<Event, String>;

fn context() -> (Ctx, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let mut config = IntegrationConfig::default();
    config.bus.retry_delay_ms = 1;
    let ctx = IntegrationContext::<Event, String>::builder()
        .config(config)
        .sink(sink.clone())
        .build()
        .unwrap();
    (ctx, sink)
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Stash {
    items: HashMap<String, u32>,
}

impl Rollback for Stash {
    type Snapshot = HashMap<String, u32>;

    fn snapshot(&self) -> Self::Snapshot {
        self.items.clone()
    }

    fn restore(&mut self, snapshot: Self::Snapshot) {
        self.items = snapshot;
    }
}

// ============================================================================
// Event bus
// ============================================================================

/// Random subscribe/unsubscribe/publish sequences against a reference model.
#[test]
fn test_delivery_matches_subscription_timeline() {
    for seed in 0..20_u64 {
        let (ctx, _) = context();
        let mut rng = StdRng::seed_from_u64(seed);
        let received: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut live: Vec<(u32, Subscription<Event>)> = Vec::new();
        let mut next_handler = 0_u32;

        for publish_no in 0..40_u32 {
            match rng.gen_range(0..3) {
                0 => {
                    let handler = next_handler;
                    next_handler += 1;
                    let log = Arc::clone(&received);
                    let sub = ctx.bus().subscribe(Kind::Damage, move |env| {
                        if let Event::Damage(n) = env.payload() {
                            log.lock().push((handler, *n));
                        }
                        Ok(())
                    });
                    live.push((handler, sub));
                }
                1 if !live.is_empty() => {
                    let index = rng.gen_range(0..live.len());
                    let (_, sub) = live.remove(index);
                    assert!(ctx.bus().unsubscribe(sub));
                }
                _ => {
                    received.lock().clear();
                    ctx.bus().publish(Event::Damage(publish_no));

                    let expected: Vec<(u32, u32)> =
                        live.iter().map(|(h, _)| (*h, publish_no)).collect();
                    assert_eq!(*received.lock(), expected, "seed {seed}, publish {publish_no}");
                }
            }
        }
    }
}

#[test]
fn test_retry_recovers_with_warnings_only() {
    let (ctx, sink) = context();
    let failures_left = Arc::new(AtomicU32::new(2));

    let left = Arc::clone(&failures_left);
    let _sub = ctx.bus().subscribe(Kind::Loot, move |_| {
        if left.load(Ordering::SeqCst) > 0 {
            left.fetch_sub(1, Ordering::SeqCst);
            return Err("loot table locked".into());
        }
        Ok(())
    });

    let outcome = ctx
        .bus()
        .publish_with_retry(&Event::Loot("gem".into()), ctx.retry_policy());

    assert_eq!(
        outcome,
        DeliveryStatus::Delivered {
            attempts: 3,
            receivers: 1
        }
    );
    assert_eq!(sink.logs_at(LogLevel::Warning).len(), 2);
    assert!(sink.alerts().is_empty());
}

#[test]
fn test_retry_exhaustion_alerts_exactly_once() {
    let (ctx, sink) = context();
    let _sub = ctx.bus().subscribe(Kind::Loot, |_| Err("loot service down".into()));

    let outcome = ctx
        .bus()
        .publish_with_retry(&Event::Loot("gem".into()), RetryPolicy::new(4, Duration::ZERO));

    assert!(matches!(outcome, DeliveryStatus::Exhausted { attempts: 4, .. }));
    assert_eq!(sink.alerts().len(), 1);
    assert_eq!(sink.logs_with_status(status::RETRYING).len(), 3);
}

#[test]
fn test_concurrent_publish_and_subscribe() {
    let (ctx, _) = context();
    let ctx = Arc::new(ctx);
    let barrier = Arc::new(Barrier::new(4));
    let delivered = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let ctx = Arc::clone(&ctx);
            let barrier = Arc::clone(&barrier);
            let delivered = Arc::clone(&delivered);
            std::thread::spawn(move || {
                barrier.wait();
                for i in 0..200 {
                    if worker % 2 == 0 {
                        ctx.bus().publish(Event::Damage(i));
                    } else {
                        let delivered = Arc::clone(&delivered);
                        let sub = ctx.bus().subscribe(Kind::Damage, move |_| {
                            delivered.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        });
                        drop(sub);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ctx.bus().subscriber_count(Kind::Damage), 0);
    assert_eq!(ctx.bus().events_published(), 400);
}

// ============================================================================
// Request broker
// ============================================================================

#[test]
fn test_request_round_trip_and_duplicate_completion() {
    let (ctx, _) = context();
    let responses = Arc::new(Mutex::new(Vec::new()));
    let pending_ids = Arc::new(Mutex::new(Vec::new()));

    let ids = Arc::clone(&pending_ids);
    let _responder = ctx.bus().subscribe(Kind::Ask, move |env| {
        if let Event::Ask(req) = env.payload() {
            ids.lock().push(req.correlation_id);
        }
        Ok(())
    });

    let log = Arc::clone(&responses);
    let id = ctx
        .broker()
        .send_request("price of sword".to_owned(), move |r| log.lock().push(r))
        .unwrap();

    assert_eq!(*pending_ids.lock(), vec![id]);
    assert!(ctx.broker().complete_request(id, "120 gold".into()));
    assert!(!ctx.broker().complete_request(id, "999 gold".into()));

    assert_eq!(*responses.lock(), vec![Ok("120 gold".to_owned())]);
}

#[test]
fn test_shutdown_cancels_pending_requests() {
    let (ctx, _) = context();
    let handle = ctx.broker().request("anyone?".to_owned()).unwrap();

    assert_eq!(ctx.shutdown(), 1);
    assert!(matches!(
        handle.wait(),
        Err(IntegrationError::RequestCancelled { .. })
    ));
}

#[test]
fn test_sweeper_resolves_timeouts() {
    let sink = Arc::new(MemorySink::new());
    let config = IntegrationConfig::from_toml_str(
        "[requests]\ntimeout_ms = 10\nsweep_interval_ms = 5\n",
    )
    .unwrap();
    let ctx: Ctx = IntegrationContext::<Event, String>::builder()
        .config(config)
        .sink(sink.clone())
        .build()
        .unwrap();
    let sweeper = ctx.spawn_sweeper().unwrap();

    let handle = ctx.broker().request("lost".to_owned()).unwrap();
    let result = handle.wait_timeout(Duration::from_secs(2));
    drop(sweeper);

    assert_eq!(result, Err(IntegrationError::RequestTimedOut(handle.id())));
    assert_eq!(ctx.broker().pending_count(), 0);
    assert!(sink.metric_total("requests.timed_out") >= 1.0);
}

// ============================================================================
// Synchronized state
// ============================================================================

#[test]
fn test_snapshot_restore_notifies_observers() {
    let (ctx, _) = context();
    let state = ctx.synced_state::<u32>("boss_hp").with_initial(500);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    state.register_observer(move |hp| log.lock().push(*hp));

    let stamp = state.create_snapshot("phase 1").unwrap();
    state.set_state(120).unwrap();
    state.restore_snapshot(stamp).unwrap();

    assert_eq!(state.get(), Some(500));
    assert_eq!(*seen.lock(), vec![120, 500]);

    let missing = state.restore_snapshot(crosslink_core::SnapshotStamp::from_micros(7));
    assert!(matches!(missing, Err(IntegrationError::SnapshotNotFound { .. })));
    assert_eq!(state.get(), Some(500));
}

#[test]
fn test_conflicting_proposals_resolve_deterministically() {
    let (ctx, _) = context();

    for _ in 0..100 {
        let state = Arc::new(
            ctx.synced_state::<i32>("threat")
                .with_initial(0)
                .with_conflict_resolver(|a, b| *a.max(b)),
        );
        let base = state.version();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [7, 5]
            .into_iter()
            .map(|value| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    state.set_state_at(base, value)
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        assert_eq!(state.get(), Some(7));
        assert_eq!(state.version(), 3);
    }
}

// ============================================================================
// Transactions
// ============================================================================

fn add(stash: &mut Stash, item: &str, amount: u32) -> Result<u32, String> {
    let count = stash.items.entry(item.to_owned()).or_insert(0);
    *count += amount;
    Ok(*count)
}

#[test]
fn test_idempotent_apply() {
    let (ctx, sink) = context();
    let stash = ctx.guarded("stash", Stash::default());
    let request = TxRequest::new("add").from_source("quest").with_key("k1");

    stash.apply(&request, |s| add(s, "herb", 3)).unwrap();
    let once = stash.read(Clone::clone);
    let second = stash.apply(&request, |s| add(s, "herb", 3)).unwrap();

    assert!(second.was_skipped());
    assert_eq!(stash.read(Clone::clone), once);

    let statuses: Vec<_> = sink
        .logs()
        .into_iter()
        .filter(|l| l.target == "stash")
        .filter_map(|l| l.status)
        .collect();
    assert_eq!(statuses, vec![status::COMMITTED, status::IDEMPOTENT_SKIP]);
}

#[test]
fn test_failed_mutation_leaves_no_trace() {
    let (ctx, _) = context();
    let stash = ctx.guarded("stash", Stash::default());
    stash
        .apply(&TxRequest::new("add"), |s| add(s, "ore", 2))
        .unwrap();
    let before = stash.read(Clone::clone);

    let result = stash.apply(&TxRequest::new("craft"), |s| -> Result<u32, String> {
        add(s, "ingot", 1)?;
        s.items.remove("ore");
        Err("furnace cold".into())
    });

    assert!(matches!(
        result,
        Err(IntegrationError::TransactionRolledBack { .. })
    ));
    assert_eq!(stash.read(Clone::clone), before);
    assert_eq!(ctx.journal().count(TxStatus::RolledBack), 1);
    assert_eq!(ctx.journal().count(TxStatus::Committed), 1);
    assert_eq!(ctx.journal().count(TxStatus::Pending), 0);
}

#[test]
fn test_guarded_resources_do_not_block_each_other() {
    let (ctx, _) = context();
    let a = Arc::new(ctx.guarded::<Stash, u32>("a", Stash::default()));
    let b = Arc::new(ctx.guarded::<Stash, u32>("b", Stash::default()));
    let entered = Arc::new(Barrier::new(2));

    // Holds a's lock until b has been mutated from another thread.
    let gate = Arc::clone(&entered);
    let b_inner = Arc::clone(&b);
    a.apply(&TxRequest::new("hold"), move |s| {
        let worker = std::thread::spawn(move || {
            gate.wait();
            b_inner.apply(&TxRequest::new("add"), |s| add(s, "x", 1))
        });
        entered.wait();
        let result = worker.join().map_err(|_| "worker panicked".to_owned())?;
        result.map_err(|e| e.to_string())?;
        add(s, "y", 1)
    })
    .unwrap();

    assert_eq!(b.read(|s| s.items.get("x").copied()), Some(1));
}

// ============================================================================
// Registry
// ============================================================================

trait Combat: Send + Sync {
    fn resolve_hit(&self, damage: u32) -> u32;
}

struct Melee;
struct Ranged;

impl Combat for Melee {
    fn resolve_hit(&self, damage: u32) -> u32 {
        damage
    }
}

impl Combat for Ranged {
    fn resolve_hit(&self, damage: u32) -> u32 {
        damage / 2
    }
}

#[test]
fn test_registry_last_registration_wins() {
    let (ctx, _) = context();
    ctx.registry().register::<dyn Combat>(Arc::new(Melee));
    ctx.registry().register::<dyn Combat>(Arc::new(Ranged));

    let combat = ctx.registry().resolve::<dyn Combat>().unwrap();
    assert_eq!(combat.resolve_hit(10), 5);

    ctx.registry().unregister::<dyn Combat>();
    assert!(matches!(
        ctx.registry().resolve::<dyn Combat>(),
        Err(IntegrationError::CapabilityNotRegistered { .. })
    ));
}
