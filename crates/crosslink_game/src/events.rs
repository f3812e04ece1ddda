//! # Game Events
//!
//! The closed set of events and requests the subsystems exchange.
//!
//! This is the only module every subsystem may import. Payload shapes belong
//! to the subsystem that publishes them; the bus only routes on [`EventKind`].

use crosslink_core::{BusEvent, RequestEnvelope};

/// Player identifier.
pub type PlayerId = u32;

/// Item type identifier. 0 is reserved for "empty".
pub type ItemId = u32;

/// Quest identifier.
pub type QuestId = u32;

/// Everything that travels on the game bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GameEvent {
    /// Items changed hands for gold.
    ItemTraded {
        /// Selling player.
        seller: PlayerId,
        /// Buying player.
        buyer: PlayerId,
        /// Item type.
        item_id: ItemId,
        /// Quantity.
        count: u32,
        /// Total price paid.
        price: u64,
    },
    /// A player's item count changed.
    InventoryChanged {
        /// Owner.
        player: PlayerId,
        /// Item type.
        item_id: ItemId,
        /// Signed change.
        delta: i64,
    },
    /// Quest progress moved.
    QuestUpdated {
        /// Player on the quest.
        player: PlayerId,
        /// Quest.
        quest_id: QuestId,
        /// Progress so far.
        progress: u32,
        /// Whether the goal is reached.
        completed: bool,
    },
    /// The world clock advanced.
    WorldTick {
        /// Absolute tick.
        tick: u64,
        /// In-game day.
        day: u32,
        /// In-game hour.
        hour: u8,
    },
    /// A request for whichever subsystem answers it.
    Request(RequestEnvelope<GameRequest>),
}

/// Routing key of a [`GameEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`GameEvent::ItemTraded`]
    ItemTraded,
    /// [`GameEvent::InventoryChanged`]
    InventoryChanged,
    /// [`GameEvent::QuestUpdated`]
    QuestUpdated,
    /// [`GameEvent::WorldTick`]
    WorldTick,
    /// [`GameEvent::Request`]
    Request,
}

impl BusEvent for GameEvent {
    type Kind = EventKind;

    #[inline]
    fn kind(&self) -> EventKind {
        match self {
            Self::ItemTraded { .. } => EventKind::ItemTraded,
            Self::InventoryChanged { .. } => EventKind::InventoryChanged,
            Self::QuestUpdated { .. } => EventKind::QuestUpdated,
            Self::WorldTick { .. } => EventKind::WorldTick,
            Self::Request(_) => EventKind::Request,
        }
    }
}

impl From<RequestEnvelope<GameRequest>> for GameEvent {
    fn from(envelope: RequestEnvelope<GameRequest>) -> Self {
        Self::Request(envelope)
    }
}

/// Questions one subsystem asks another without knowing who answers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GameRequest {
    /// Price of `count` units of an item (economy answers).
    PriceQuote {
        /// Item type.
        item_id: ItemId,
        /// Quantity.
        count: u32,
    },
    /// How many of an item a player holds (inventory answers).
    ItemCount {
        /// Owner.
        player: PlayerId,
        /// Item type.
        item_id: ItemId,
    },
    /// A player's gold (economy answers).
    Balance {
        /// Player.
        player: PlayerId,
    },
}

/// Answers to [`GameRequest`]s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GameResponse {
    /// Gold amount (price or balance).
    Gold(u64),
    /// Item count.
    Count(u32),
    /// The responder could not answer.
    Rejected(String),
}
