//! # CROSSLINK Demo
//!
//! Runs one market session through every subsystem and prints what the
//! integration layer recorded.
//!
//! ```bash
//! # Default settings from data/crosslink.toml
//! cargo run --bin crosslink_demo
//!
//! # Custom settings, verbose diagnostics
//! RUST_LOG=debug cargo run --bin crosslink_demo -- path/to/crosslink.toml
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use crosslink_core::{IntegrationConfig, TxStatus};
use crosslink_game::{
    load_quests, EconomyCapability, GameContext, GameRequest, GameResponse, GameResult,
    GameWorld, InventoryCapability, ItemCatalog, QuestCapability, WorldCapability,
};
use tracing_subscriber::EnvFilter;

const SELLER: u32 = 1;
const BUYER: u32 = 2;
const IRON_ORE: u32 = 1;
const STEEL_SWORD: u32 = 4;
const MINER_QUEST: u32 = 1;

fn data_path(file: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data").join(file)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn run() -> GameResult<()> {
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| data_path("crosslink.toml"), PathBuf::from);
    let config = IntegrationConfig::load(&config_path)?;

    let ctx = GameContext::builder().config(config).build()?;
    let sweeper = ctx.spawn_sweeper()?;

    let world = GameWorld::install(
        &ctx,
        ItemCatalog::load(data_path("items.toml"))?,
        load_quests(data_path("quests.toml"))?,
    );
    let registry = ctx.registry();
    let inventory = registry.resolve::<dyn InventoryCapability>()?;
    let economy = registry.resolve::<dyn EconomyCapability>()?;

    println!("Capabilities:");
    for binding in registry.capabilities() {
        println!("  {}", binding.capability);
    }
    println!();

    // === STARTING STATE ===
    economy.grant(BUYER, 500, Some("starting-funds-2"))?;
    inventory.give(SELLER, IRON_ORE, 40, Some("mine-run-1"))?;
    // A replayed loot drop changes nothing.
    inventory.give(SELLER, IRON_ORE, 40, Some("mine-run-1"))?;
    world.quests.accept(BUYER, MINER_QUEST)?;

    // === MARKET ===
    let receipt = economy.trade(SELLER, BUYER, IRON_ORE, 20, "market-1")?;
    println!("Trade settled: {} ore for {} gold", receipt.count, receipt.price);
    economy.trade(SELLER, BUYER, IRON_ORE, 20, "market-1")?;

    match economy.trade(SELLER, BUYER, STEEL_SWORD, 1, "market-2") {
        Ok(_) => println!("Unexpected: seller had no sword"),
        Err(err) => println!("Trade refused: {err}"),
    }

    println!(
        "Miner quest complete: {}",
        world.quests.is_completed(BUYER, MINER_QUEST)
    );

    // === REQUESTS ===
    let broker = ctx.broker();
    let balance = broker
        .request(GameRequest::Balance { player: BUYER })?
        .wait_timeout(Duration::from_secs(1))?;
    let quote = broker
        .request(GameRequest::PriceQuote {
            item_id: STEEL_SWORD,
            count: 2,
        })?
        .wait_timeout(Duration::from_secs(1))?;
    if let (GameResponse::Gold(balance), GameResponse::Gold(quote)) = (balance, quote) {
        println!("Buyer balance {balance}, two swords cost {quote}");
    }

    // === WORLD ===
    let dawn = world.clock.checkpoint("dawn")?;
    world.clock.advance(30)?;
    let later = world.clock.now();
    let rewound = world.clock.rewind(dawn)?;
    println!(
        "Clock day {} hour {}, rewound to day {} hour {}",
        later.day, later.hour, rewound.day, rewound.hour
    );

    // === SUMMARY ===
    let journal = ctx.journal();
    let book = world.economy.trade_book();
    println!();
    println!("Transactions committed:   {}", journal.count(TxStatus::Committed));
    println!("Transactions rolled back: {}", journal.count(TxStatus::RolledBack));
    println!("Trades settled:           {} ({} gold)", book.settled, book.volume);
    println!("Gold in circulation:      {}", world.economy.total_supply());
    println!("Events published:         {}", ctx.bus().events_published());

    sweeper.stop();
    ctx.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("crosslink_demo failed: {err}");
            ExitCode::FAILURE
        }
    }
}
