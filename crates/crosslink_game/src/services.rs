//! # Inventory and Economy Services
//!
//! The two subsystems that own player wealth. Each wraps its state in a
//! [`GuardedResource`], registers itself under a capability trait, and
//! answers the [`GameRequest`]s it owns.
//!
//! ## Trades
//!
//! A trade touches two resources: gold in the ledger and items in the
//! inventories. The economy pays first, then asks whichever provider holds
//! [`InventoryCapability`] to move the items. If that fails the payment is
//! refunded. The whole sequence runs inside one transaction on the trade
//! book, keyed by the caller's idempotency key, so:
//!
//! - a successful trade repeated with the same key is skipped
//! - a failed trade leaves no receipt and may be retried with the same key
//!
//! Lock order is trade book, then ledger, then inventories. Inventory never
//! calls back into the economy, so the order cannot invert.
//!
//! Inventory changes made while a trade holds the trade book are held back
//! and published once the trade's transaction has closed, so
//! `InventoryChanged` handlers may start trades of their own.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use crosslink_core::{
    Applied, CapabilityRegistry, Diagnostics, EventBus, GuardedResource, LogLevel,
    RequestBroker, Rollback, Subscription, TxRequest,
};

use crate::capabilities::{resolve, EconomyCapability, InventoryCapability, TradeReceipt};
use crate::error::{GameError, GameResult};
use crate::events::{EventKind, GameEvent, GameRequest, GameResponse, ItemId, PlayerId};
use crate::inventory::{Inventories, ItemCatalog};
use crate::ledger::Ledger;
use crate::GameContext;

type GameBroker = RequestBroker<GameEvent, GameResponse>;

/// Runs a guarded mutation, surfacing the domain error when there is one.
///
/// A mutation that returned a [`GameError`] reports that error; a panic
/// reports the framework's `TransactionRolledBack`.
pub(crate) fn guarded_apply<R, O, F>(
    resource: &GuardedResource<R, O>,
    request: &TxRequest,
    mutation: F,
) -> GameResult<Applied<O>>
where
    R: Rollback,
    O: Clone,
    F: FnOnce(&mut R) -> GameResult<O>,
{
    let mut cause = None;
    let result = resource.apply(request, |state| {
        mutation(state).map_err(|err| {
            cause = Some(err.clone());
            err
        })
    });
    match result {
        Ok(applied) => Ok(applied),
        Err(err) => Err(cause.unwrap_or(GameError::Integration(err))),
    }
}

type HeldChange = (Arc<EventBus<GameEvent>>, GameEvent);

thread_local! {
    /// Inventory changes raised on this thread inside an open trade.
    static HELD_CHANGES: RefCell<Option<Vec<HeldChange>>> = const { RefCell::new(None) };
}

/// Publishes `event` now, or holds it if this thread is inside a trade.
fn publish_or_hold(bus: &Arc<EventBus<GameEvent>>, event: GameEvent) {
    let event = HELD_CHANGES.with(|held| match held.borrow_mut().as_mut() {
        Some(changes) => {
            changes.push((Arc::clone(bus), event));
            None
        }
        None => Some(event),
    });
    if let Some(event) = event {
        bus.publish(event);
    }
}

/// Runs `f` with inventory changes held, then publishes them in order.
fn with_held_changes<T>(f: impl FnOnce() -> T) -> T {
    let outer = HELD_CHANGES.with(|held| held.borrow_mut().replace(Vec::new()));
    let result = f();
    let changes = HELD_CHANGES.with(|held| std::mem::replace(&mut *held.borrow_mut(), outer));
    for (bus, event) in changes.unwrap_or_default() {
        bus.publish(event);
    }
    result
}

fn tx(operation: &str, source: &str, key: Option<&str>) -> TxRequest {
    let request = TxRequest::new(operation).from_source(source);
    match key {
        Some(key) => request.with_key(key),
        None => request,
    }
}

// ============================================================================
// Inventory
// ============================================================================

/// Owns every player's items.
pub struct InventoryService {
    items: GuardedResource<Inventories, u32>,
    catalog: Arc<ItemCatalog>,
    bus: Arc<EventBus<GameEvent>>,
    _requests: Subscription<GameEvent>,
}

impl InventoryService {
    /// Creates the service, registers it as [`InventoryCapability`] and
    /// starts answering [`GameRequest::ItemCount`].
    pub fn install(ctx: &GameContext, catalog: Arc<ItemCatalog>) -> Arc<Self> {
        let broker = Arc::downgrade(ctx.broker());
        let service = Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            let requests = ctx.bus().subscribe(EventKind::Request, move |envelope| {
                if let (Some(service), Some(broker)) = (this.upgrade(), broker.upgrade()) {
                    service.answer(&broker, envelope.payload());
                }
                Ok(())
            });
            Self {
                items: ctx.guarded("inventory", Inventories::new()),
                catalog,
                bus: Arc::clone(ctx.bus()),
                _requests: requests,
            }
        });

        let provider: Arc<dyn InventoryCapability> = service.clone();
        ctx.registry().register(provider);
        service
    }

    /// Read access to all inventories.
    pub fn read<U>(&self, f: impl FnOnce(&Inventories) -> U) -> U {
        self.items.read(f)
    }

    fn answer(&self, broker: &GameBroker, event: &GameEvent) {
        let GameEvent::Request(envelope) = event else {
            return;
        };
        if let GameRequest::ItemCount { player, item_id } = envelope.request {
            broker.complete_request(
                envelope.correlation_id,
                GameResponse::Count(self.count(player, item_id)),
            );
        }
    }

    fn publish_change(&self, player: PlayerId, item_id: ItemId, delta: i64) {
        publish_or_hold(
            &self.bus,
            GameEvent::InventoryChanged {
                player,
                item_id,
                delta,
            },
        );
    }
}

impl InventoryCapability for InventoryService {
    fn count(&self, player: PlayerId, item_id: ItemId) -> u32 {
        self.items.read(|items| items.count(player, item_id))
    }

    fn give(
        &self,
        player: PlayerId,
        item_id: ItemId,
        count: u32,
        key: Option<&str>,
    ) -> GameResult<u32> {
        let item = self.catalog.get(item_id)?;
        let applied = guarded_apply(&self.items, &tx("give", "inventory", key), |items| {
            items.give(player, item, count)
        })?;
        if !applied.was_skipped() {
            self.publish_change(player, item_id, i64::from(count));
        }
        Ok(applied.output)
    }

    fn take(
        &self,
        player: PlayerId,
        item_id: ItemId,
        count: u32,
        key: Option<&str>,
    ) -> GameResult<u32> {
        let applied = guarded_apply(&self.items, &tx("take", "inventory", key), |items| {
            items.take(player, item_id, count)
        })?;
        if !applied.was_skipped() {
            self.publish_change(player, item_id, -i64::from(count));
        }
        Ok(applied.output)
    }

    fn transfer(
        &self,
        from: PlayerId,
        to: PlayerId,
        item_id: ItemId,
        count: u32,
        key: Option<&str>,
    ) -> GameResult<()> {
        let item = self.catalog.get(item_id)?;
        let applied = guarded_apply(&self.items, &tx("transfer", "inventory", key), |items| {
            items.take(from, item_id, count)?;
            items.give(to, item, count)
        })?;
        if !applied.was_skipped() {
            self.publish_change(from, item_id, -i64::from(count));
            self.publish_change(to, item_id, i64::from(count));
        }
        Ok(())
    }
}

// ============================================================================
// Economy
// ============================================================================

/// Running totals of settled trades.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TradeBook {
    /// Trades settled.
    pub settled: u64,
    /// Gold moved by trades.
    pub volume: u64,
}

impl Rollback for TradeBook {
    type Snapshot = Self;

    fn snapshot(&self) -> Self {
        *self
    }

    fn restore(&mut self, snapshot: Self) {
        *self = snapshot;
    }
}

/// Owns gold and settles trades.
pub struct EconomyService {
    ledger: GuardedResource<Ledger, u64>,
    trades: GuardedResource<TradeBook, TradeReceipt>,
    catalog: Arc<ItemCatalog>,
    registry: Weak<CapabilityRegistry>,
    bus: Arc<EventBus<GameEvent>>,
    diagnostics: Diagnostics,
    _requests: Subscription<GameEvent>,
}

impl EconomyService {
    /// Creates the service, registers it as [`EconomyCapability`] and starts
    /// answering [`GameRequest::PriceQuote`] and [`GameRequest::Balance`].
    pub fn install(ctx: &GameContext, catalog: Arc<ItemCatalog>) -> Arc<Self> {
        let broker = Arc::downgrade(ctx.broker());
        let service = Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            let requests = ctx.bus().subscribe(EventKind::Request, move |envelope| {
                if let (Some(service), Some(broker)) = (this.upgrade(), broker.upgrade()) {
                    service.answer(&broker, envelope.payload());
                }
                Ok(())
            });
            Self {
                ledger: ctx.guarded("ledger", Ledger::new()),
                trades: ctx.guarded("trades", TradeBook::default()),
                catalog,
                registry: Arc::downgrade(ctx.registry()),
                bus: Arc::clone(ctx.bus()),
                diagnostics: ctx.diagnostics().clone(),
                _requests: requests,
            }
        });

        let provider: Arc<dyn EconomyCapability> = service.clone();
        ctx.registry().register(provider);
        service
    }

    /// Gold in circulation.
    #[must_use]
    pub fn total_supply(&self) -> u64 {
        self.ledger.read(Ledger::total_supply)
    }

    /// Settled trade totals.
    #[must_use]
    pub fn trade_book(&self) -> TradeBook {
        self.trades.read(|book| *book)
    }

    fn answer(&self, broker: &GameBroker, event: &GameEvent) {
        let GameEvent::Request(envelope) = event else {
            return;
        };
        let response = match envelope.request {
            GameRequest::PriceQuote { item_id, count } => match self.quote(item_id, count) {
                Ok(price) => GameResponse::Gold(price),
                Err(err) => GameResponse::Rejected(err.to_string()),
            },
            GameRequest::Balance { player } => GameResponse::Gold(self.balance(player)),
            GameRequest::ItemCount { .. } => return,
        };
        broker.complete_request(envelope.correlation_id, response);
    }

    /// Pays, moves the items, and refunds if the move fails.
    fn settle(
        &self,
        inventory: &dyn InventoryCapability,
        receipt: &TradeReceipt,
    ) -> GameResult<()> {
        guarded_apply(&self.ledger, &tx("trade.pay", "economy", None), |ledger| {
            ledger.transfer(receipt.buyer, receipt.seller, receipt.price)
        })?;

        let Err(err) = inventory.transfer(
            receipt.seller,
            receipt.buyer,
            receipt.item_id,
            receipt.count,
            None,
        ) else {
            return Ok(());
        };

        let refund = guarded_apply(&self.ledger, &tx("trade.refund", "economy", None), |ledger| {
            ledger.transfer(receipt.seller, receipt.buyer, receipt.price)
        });
        if let Err(refund_err) = refund {
            self.diagnostics.emit(
                LogLevel::Critical,
                &format!(
                    "refund of {} gold to player {} failed: {refund_err}",
                    receipt.price, receipt.buyer
                ),
                "economy",
                "ledger",
                "trade.refund",
                None,
            );
        }
        Err(err)
    }
}

impl EconomyCapability for EconomyService {
    fn balance(&self, player: PlayerId) -> u64 {
        self.ledger.read(|ledger| ledger.balance(player))
    }

    fn quote(&self, item_id: ItemId, count: u32) -> GameResult<u64> {
        let item = self.catalog.get(item_id)?;
        item.base_price
            .checked_mul(u64::from(count))
            .ok_or(GameError::ArithmeticOverflow)
    }

    fn grant(&self, player: PlayerId, amount: u64, key: Option<&str>) -> GameResult<u64> {
        let applied = guarded_apply(&self.ledger, &tx("grant", "economy", key), |ledger| {
            ledger.credit(player, amount)
        })?;
        Ok(applied.output)
    }

    fn trade(
        &self,
        seller: PlayerId,
        buyer: PlayerId,
        item_id: ItemId,
        count: u32,
        key: &str,
    ) -> GameResult<TradeReceipt> {
        if !self.catalog.get(item_id)?.tradeable {
            return Err(GameError::NotTradeable(item_id));
        }
        let receipt = TradeReceipt {
            seller,
            buyer,
            item_id,
            count,
            price: self.quote(item_id, count)?,
        };
        let inventory = resolve::<dyn InventoryCapability>(&self.registry)?;

        let request = tx("trade", "economy", Some(key));
        let applied = with_held_changes(|| {
            guarded_apply(&self.trades, &request, |book| {
                self.settle(inventory.as_ref(), &receipt)?;
                book.settled += 1;
                book.volume = book.volume.saturating_add(receipt.price);
                Ok(receipt.clone())
            })
        })?;

        if !applied.was_skipped() {
            self.bus.publish(GameEvent::ItemTraded {
                seller,
                buyer,
                item_id,
                count,
                price: applied.output.price,
            });
        }
        Ok(applied.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosslink_core::{IntegrationError, MemorySink};

    const CATALOG: &str = r#"
        [[items]]
        id = 1
        name = "Iron Ore"
        max_stack = 64
        base_price = 5

        [[items]]
        id = 2
        name = "Quest Token"
        max_stack = 1
        base_price = 0
        tradeable = false
    "#;

    struct Fixture {
        ctx: GameContext,
        sink: Arc<MemorySink>,
        inventory: Arc<InventoryService>,
        economy: Arc<EconomyService>,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(MemorySink::new());
        let ctx = GameContext::builder().sink(sink.clone()).build().unwrap();
        let catalog = Arc::new(ItemCatalog::from_toml_str(CATALOG).unwrap());
        let inventory = InventoryService::install(&ctx, Arc::clone(&catalog));
        let economy = EconomyService::install(&ctx, catalog);
        Fixture {
            ctx,
            sink,
            inventory,
            economy,
        }
    }

    #[test]
    fn test_trade_moves_gold_and_items() {
        let f = fixture();
        f.inventory.give(1, 1, 10, None).unwrap();
        f.economy.grant(2, 100, None).unwrap();

        let receipt = f.economy.trade(1, 2, 1, 4, "trade-1").unwrap();

        assert_eq!(receipt.price, 20);
        assert_eq!(f.economy.balance(1), 20);
        assert_eq!(f.economy.balance(2), 80);
        assert_eq!(f.inventory.count(1, 1), 6);
        assert_eq!(f.inventory.count(2, 1), 4);
        assert_eq!(f.economy.trade_book().settled, 1);
    }

    #[test]
    fn test_trade_repeat_with_same_key_is_skipped() {
        let f = fixture();
        f.inventory.give(1, 1, 10, None).unwrap();
        f.economy.grant(2, 100, None).unwrap();

        let first = f.economy.trade(1, 2, 1, 4, "trade-1").unwrap();
        let second = f.economy.trade(1, 2, 1, 4, "trade-1").unwrap();

        assert_eq!(first, second);
        assert_eq!(f.economy.balance(2), 80);
        assert_eq!(f.inventory.count(2, 1), 4);
        assert_eq!(f.sink.metric_total("tx.idempotent_skip"), 1.0);
    }

    #[test]
    fn test_failed_item_move_refunds_buyer() {
        let f = fixture();
        f.inventory.give(1, 1, 2, None).unwrap();
        f.economy.grant(2, 100, None).unwrap();

        let result = f.economy.trade(1, 2, 1, 5, "trade-1");

        assert!(matches!(result, Err(GameError::InsufficientItems { .. })));
        assert_eq!(f.economy.balance(1), 0);
        assert_eq!(f.economy.balance(2), 100);
        assert_eq!(f.economy.total_supply(), 100);
        assert_eq!(f.economy.trade_book(), TradeBook::default());

        // The failed key left no receipt, so the same key may settle later.
        f.inventory.give(1, 1, 3, None).unwrap();
        assert!(f.economy.trade(1, 2, 1, 5, "trade-1").is_ok());
        assert_eq!(f.inventory.count(2, 1), 5);
    }

    #[test]
    fn test_insufficient_funds_rejected() {
        let f = fixture();
        f.inventory.give(1, 1, 10, None).unwrap();

        let result = f.economy.trade(1, 2, 1, 1, "trade-1");

        assert!(matches!(result, Err(GameError::InsufficientFunds { player: 2, .. })));
        assert_eq!(f.inventory.count(1, 1), 10);
    }

    #[test]
    fn test_untradeable_item_rejected() {
        let f = fixture();
        f.inventory.give(1, 2, 1, None).unwrap();
        assert_eq!(
            f.economy.trade(1, 2, 2, 1, "trade-1"),
            Err(GameError::NotTradeable(2))
        );
    }

    #[test]
    fn test_trade_without_inventory_provider() {
        let f = fixture();
        f.ctx.registry().unregister::<dyn InventoryCapability>();

        let result = f.economy.trade(1, 2, 1, 1, "trade-1");

        assert!(matches!(
            result,
            Err(GameError::Integration(IntegrationError::CapabilityNotRegistered { .. }))
        ));
    }

    #[test]
    fn test_requests_answered_by_owner() {
        let f = fixture();
        f.inventory.give(3, 1, 7, None).unwrap();
        f.economy.grant(3, 42, None).unwrap();
        let broker = f.ctx.broker();

        let count = broker
            .request(GameRequest::ItemCount { player: 3, item_id: 1 })
            .unwrap()
            .wait()
            .unwrap();
        let balance = broker
            .request(GameRequest::Balance { player: 3 })
            .unwrap()
            .wait()
            .unwrap();
        let quote = broker
            .request(GameRequest::PriceQuote { item_id: 9, count: 1 })
            .unwrap()
            .wait()
            .unwrap();

        assert_eq!(count, GameResponse::Count(7));
        assert_eq!(balance, GameResponse::Gold(42));
        assert!(matches!(quote, GameResponse::Rejected(_)));
        assert_eq!(broker.pending_count(), 0);
    }

    #[test]
    fn test_keyed_give_publishes_once() {
        let f = fixture();
        let changes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&changes);
        let _sub = f.ctx.bus().subscribe(EventKind::InventoryChanged, move |env| {
            seen.lock().push(env.payload().clone());
            Ok(())
        });

        f.inventory.give(1, 1, 5, Some("loot-9")).unwrap();
        f.inventory.give(1, 1, 5, Some("loot-9")).unwrap();

        assert_eq!(f.inventory.count(1, 1), 5);
        assert_eq!(
            *changes.lock(),
            vec![GameEvent::InventoryChanged {
                player: 1,
                item_id: 1,
                delta: 5
            }]
        );
    }

    #[test]
    fn test_inventory_handler_may_start_a_trade() {
        let f = fixture();
        f.inventory.give(1, 1, 10, None).unwrap();
        f.inventory.give(3, 1, 10, None).unwrap();
        f.economy.grant(2, 100, None).unwrap();

        // Restock: every item bought from player 1 triggers a follow-up
        // purchase from player 3, from inside the change handler.
        let economy = Arc::downgrade(&f.economy);
        let follow_ups = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let results = Arc::clone(&follow_ups);
        let _sub = f.ctx.bus().subscribe(EventKind::InventoryChanged, move |env| {
            if let GameEvent::InventoryChanged { player: 1, delta, .. } = *env.payload() {
                if let Some(economy) = economy.upgrade() {
                    let count = u32::try_from(-delta).unwrap_or(0);
                    results.lock().push(economy.trade(3, 2, 1, count, "restock").is_ok());
                }
            }
            Ok(())
        });

        f.economy.trade(1, 2, 1, 2, "first").unwrap();

        assert_eq!(*follow_ups.lock(), vec![true]);
        assert_eq!(f.inventory.count(2, 1), 4);
        assert_eq!(f.economy.trade_book().settled, 2);
    }
}
