//! Durable room state.
//!
//! The realtime layer never persists anything itself: every mutation goes
//! through a [`Store`], which hands back the room's fresh authoritative state
//! so the caller can fan it out without a second read.

mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use sqlite::SqliteStore;

/// While a room sits in this phase, participants only see their own items.
pub const PRIVATE_PHASE: i64 = 1;

pub type DynStore = Arc<dyn Store>;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("room not found")]
    RoomNotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("item not found")]
    ItemNotFound,

    #[error("action not found")]
    ActionNotFound,

    #[error("item cannot be nested there")]
    InvalidNesting,

    #[error("incorrect permissions")]
    PermissionDenied,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Worked,
    Improve,
    Question,
}

impl ItemKind {
    pub const ALL: [ItemKind; 3] = [ItemKind::Worked, ItemKind::Improve, ItemKind::Question];

    pub fn as_str(&self) -> &'static str {
        use ItemKind::*;
        match self {
            Worked => "worked",
            Improve => "improve",
            Question => "question",
        }
    }

    pub fn parse(s: &str) -> Option<ItemKind> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// Outbound event type carrying this kind's refreshed collection.
    pub fn updated_event(&self) -> &'static str {
        use ItemKind::*;
        match self {
            Worked => "item_worked_updated",
            Improve => "item_improve_updated",
            Question => "item_question_updated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub votes: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: Uuid,
    pub room_id: Uuid,
    pub content: String,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "id")]
    pub user_id: Uuid,
    pub name: String,
    pub active: bool,
    #[serde(skip)]
    pub abandoned: bool,
}

/// The three item collections of a room, as of one mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomItems {
    pub phase: i64,
    pub worked: Vec<Item>,
    pub improve: Vec<Item>,
    pub question: Vec<Item>,
}

impl RoomItems {
    pub fn from_items(phase: i64, items: Vec<Item>) -> Self {
        let mut room_items = RoomItems { phase, ..Default::default() };
        for item in items {
            match item.kind {
                ItemKind::Worked => room_items.worked.push(item),
                ItemKind::Improve => room_items.improve.push(item),
                ItemKind::Question => room_items.question.push(item),
            }
        }
        room_items
    }

    pub fn into_kind(self, kind: ItemKind) -> Vec<Item> {
        match kind {
            ItemKind::Worked => self.worked,
            ItemKind::Improve => self.improve,
            ItemKind::Question => self.question,
        }
    }
}

/// Room header broadcast when ownership changes. Never carries items, so it
/// is safe to fan out during the private phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub phase: i64,
    pub users: Vec<Participant>,
}

/// Full room snapshot, as sent to a joining participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub phase: i64,
    pub users: Vec<Participant>,
    pub worked_items: Vec<Item>,
    pub improve_items: Vec<Item>,
    pub question_items: Vec<Item>,
    pub actions: Vec<Action>,
}

impl Room {
    /// Hides other participants' items while the room is in the private phase.
    pub fn privatize_for(&mut self, user_id: Uuid) {
        if self.phase != PRIVATE_PHASE {
            return;
        }
        for items in [&mut self.worked_items, &mut self.improve_items, &mut self.question_items] {
            items.retain(|item| item.user_id == user_id);
        }
    }
}

pub fn filter_items_by_user(user_id: Uuid, mut items: Vec<Item>) -> Vec<Item> {
    items.retain(|item| item.user_id == user_id);
    items
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_user(&self, name: &str) -> StoreResult<Uuid>;
    async fn create_room(&self, owner_id: Uuid, name: &str) -> StoreResult<Uuid>;

    async fn get_room(&self, room_id: Uuid) -> StoreResult<Room>;
    /// Rooms `user_id` owns or still belongs to, oldest first.
    async fn list_rooms_for_user(&self, user_id: Uuid) -> StoreResult<Vec<RoomSummary>>;
    /// Looks up `user_id`'s membership of `room_id`. A known user who never
    /// joined gets an inactive record; an unknown user is `UserNotFound`.
    async fn get_participant(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<Participant>;
    async fn list_participants(&self, room_id: Uuid) -> StoreResult<Vec<Participant>>;
    async fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<Vec<Participant>>;
    async fn set_inactive(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<Vec<Participant>>;
    async fn set_abandoned(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<Vec<Participant>>;

    /// Item mutations return the room's items and phase as of the same
    /// transaction, so the phase always matches the state it describes.
    async fn create_item(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        kind: ItemKind,
        content: &str,
    ) -> StoreResult<RoomItems>;
    async fn delete_item(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        item_id: Uuid,
    ) -> StoreResult<RoomItems>;
    async fn nest_item(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        item_id: Uuid,
        parent_id: Uuid,
    ) -> StoreResult<RoomItems>;
    async fn unnest_item(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        item_id: Uuid,
    ) -> StoreResult<RoomItems>;

    async fn create_action(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        content: &str,
    ) -> StoreResult<Vec<Action>>;
    async fn update_action(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        action_id: Uuid,
        completed: bool,
    ) -> StoreResult<Vec<Action>>;
    async fn delete_action(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        action_id: Uuid,
    ) -> StoreResult<Vec<Action>>;

    async fn confirm_owner(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<bool>;
    async fn set_owner(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        new_owner_id: Uuid,
    ) -> StoreResult<RoomSummary>;
    async fn delete_room(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<()>;
    async fn advance_phase(&self, room_id: Uuid, user_id: Uuid, phase: i64) -> StoreResult<i64>;
}
