//! Socket protocol: the event envelope, inbound commands, and the router that
//! turns a command into a store mutation plus an outbound event.

use axum::extract::ws::Utf8Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{filter_items_by_user, DynStore, ItemKind, StoreError, PRIVATE_PHASE};

/// Wire unit in both directions. `value` is itself JSON, decoded per `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub user_id: String,
}

impl Envelope {
    pub fn new(kind: &str, value: impl Into<String>, user_id: Option<Uuid>) -> Self {
        Self {
            kind: kind.to_owned(),
            value: value.into(),
            user_id: user_id.map(|id| id.to_string()).unwrap_or_default(),
        }
    }

    pub fn with_json<T: Serialize>(
        kind: &str,
        value: &T,
        user_id: Option<Uuid>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_string(value)?, user_id))
    }

    pub fn encode(&self) -> Result<Utf8Bytes, serde_json::Error> {
        Ok(serde_json::to_string(self)?.into())
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command {0:?}")]
    Unknown(String),

    #[error("malformed value for {command}: {source}")]
    Malformed {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed user id for promote_owner: {0}")]
    InvalidUser(#[from] uuid::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateItem { kind: ItemKind, content: String },
    DeleteItem { kind: ItemKind, id: Uuid },
    NestItem { kind: ItemKind, id: Uuid, parent_id: Uuid },
    UnnestItem { kind: ItemKind, id: Uuid },
    CreateAction { content: String },
    UpdateAction { id: Uuid, completed: bool },
    DeleteAction { id: Uuid },
    AdvancePhase { phase: i64 },
    PromoteOwner { user_id: Uuid },
    Concede,
    Abandon,
}

#[derive(Deserialize)]
struct ContentValue {
    content: String,
}

#[derive(Deserialize)]
struct IdValue {
    id: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestValue {
    id: Uuid,
    parent_id: Uuid,
}

#[derive(Deserialize)]
struct ActionUpdateValue {
    id: Uuid,
    completed: bool,
}

#[derive(Deserialize)]
struct PhaseValue {
    phase: i64,
}

impl Command {
    pub fn parse(envelope: &Envelope) -> Result<Command, CommandError> {
        let name = envelope.kind.as_str();

        if let Some((verb, kind)) = name.split_once("_item_") {
            let kind = ItemKind::parse(kind).ok_or_else(|| CommandError::Unknown(name.to_owned()))?;
            return match verb {
                "create" => {
                    let ContentValue { content } = value(envelope)?;
                    Ok(Command::CreateItem { kind, content })
                }
                "delete" => {
                    let IdValue { id } = value(envelope)?;
                    Ok(Command::DeleteItem { kind, id })
                }
                "nest" => {
                    let NestValue { id, parent_id } = value(envelope)?;
                    Ok(Command::NestItem { kind, id, parent_id })
                }
                "unnest" => {
                    let IdValue { id } = value(envelope)?;
                    Ok(Command::UnnestItem { kind, id })
                }
                _ => Err(CommandError::Unknown(name.to_owned())),
            };
        }

        match name {
            "create_action" => {
                let ContentValue { content } = value(envelope)?;
                Ok(Command::CreateAction { content })
            }
            "update_action" => {
                let ActionUpdateValue { id, completed } = value(envelope)?;
                Ok(Command::UpdateAction { id, completed })
            }
            "delete_action" => {
                let IdValue { id } = value(envelope)?;
                Ok(Command::DeleteAction { id })
            }
            "advance_phase" => {
                let PhaseValue { phase } = value(envelope)?;
                Ok(Command::AdvancePhase { phase })
            }
            // the value is the bare user id, not JSON
            "promote_owner" => {
                let user_id = Uuid::parse_str(envelope.value.trim())?;
                Ok(Command::PromoteOwner { user_id })
            }
            "concede_retrospective" => Ok(Command::Concede),
            "abandon_retrospective" => Ok(Command::Abandon),
            _ => Err(CommandError::Unknown(name.to_owned())),
        }
    }
}

fn value<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, CommandError> {
    serde_json::from_str(&envelope.value).map_err(|source| CommandError::Malformed {
        command: envelope.kind.clone(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the connection should do with a routed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Fan out to every subscriber of the room.
    Broadcast(Utf8Bytes),
    /// Deliver only to the connection that sent the command.
    Targeted(Utf8Bytes),
    /// The sender left the room for good; close its socket.
    Abandoned,
}

#[derive(Clone)]
pub struct EventRouter {
    store: DynStore,
}

impl EventRouter {
    pub fn new(store: DynStore) -> Self {
        Self { store }
    }

    /// Applies `command` as `user_id`. Any error means the command is dropped:
    /// nothing is sent and nothing changed.
    pub async fn route(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        command: Command,
    ) -> Result<Outcome, RouteError> {
        let store = &self.store;

        let (kind, items) = match command {
            Command::CreateItem { kind, content } => {
                (kind, store.create_item(room_id, user_id, kind, &content).await?)
            }
            Command::DeleteItem { kind, id } => {
                (kind, store.delete_item(room_id, user_id, id).await?)
            }
            Command::NestItem { kind, id, parent_id } => {
                (kind, store.nest_item(room_id, user_id, id, parent_id).await?)
            }
            Command::UnnestItem { kind, id } => {
                (kind, store.unnest_item(room_id, user_id, id).await?)
            }

            Command::CreateAction { content } => {
                let actions = store.create_action(room_id, user_id, &content).await?;
                return broadcast("action_updated", &actions);
            }
            Command::UpdateAction { id, completed } => {
                let actions = store.update_action(room_id, user_id, id, completed).await?;
                return broadcast("action_updated", &actions);
            }
            Command::DeleteAction { id } => {
                let actions = store.delete_action(room_id, user_id, id).await?;
                return broadcast("action_updated", &actions);
            }
            Command::AdvancePhase { phase } => {
                let phase = store.advance_phase(room_id, user_id, phase).await?;
                let envelope = Envelope::new("phase_updated", phase.to_string(), None);
                return Ok(Outcome::Broadcast(envelope.encode()?));
            }
            Command::PromoteOwner { user_id: new_owner_id } => {
                let summary = store.set_owner(room_id, user_id, new_owner_id).await?;
                return broadcast("retrospective_updated", &summary);
            }
            Command::Concede => {
                store.delete_room(room_id, user_id).await?;
                let envelope = Envelope::new("retrospective_conceded", "", None);
                return Ok(Outcome::Broadcast(envelope.encode()?));
            }
            Command::Abandon => {
                store.set_abandoned(room_id, user_id).await?;
                return Ok(Outcome::Abandoned);
            }
        };

        // while items are private nobody else's view changes
        if items.phase == PRIVATE_PHASE {
            let own = filter_items_by_user(user_id, items.into_kind(kind));
            let envelope = Envelope::with_json(kind.updated_event(), &own, None)?;
            return Ok(Outcome::Targeted(envelope.encode()?));
        }

        broadcast(kind.updated_event(), &items.into_kind(kind))
    }
}

fn broadcast<T: Serialize>(kind: &str, value: &T) -> Result<Outcome, RouteError> {
    Ok(Outcome::Broadcast(Envelope::with_json(kind, value, None)?.encode()?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::*;
    use crate::store::{SqliteStore, Store};

    fn envelope(kind: &str, value: &str) -> Envelope {
        Envelope::new(kind, value, None)
    }

    fn decode(payload: &Utf8Bytes) -> (String, Value) {
        let envelope: Envelope = serde_json::from_str(payload.as_str()).unwrap();
        let value = if envelope.value.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&envelope.value).unwrap()
        };
        (envelope.kind, value)
    }

    fn broadcast_value(outcome: Outcome) -> (String, Value) {
        let Outcome::Broadcast(payload) = outcome else {
            panic!("expected broadcast, got {outcome:?}");
        };
        decode(&payload)
    }

    fn targeted_value(outcome: Outcome) -> (String, Value) {
        let Outcome::Targeted(payload) = outcome else {
            panic!("expected targeted, got {outcome:?}");
        };
        decode(&payload)
    }

    fn contents(value: &Value) -> Vec<&str> {
        value.as_array().unwrap().iter().map(|item| item["content"].as_str().unwrap()).collect()
    }

    fn create(kind: ItemKind, content: &str) -> Command {
        Command::CreateItem { kind, content: content.to_owned() }
    }

    async fn setup() -> (Arc<SqliteStore>, EventRouter, Uuid, Uuid, Uuid) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let owner = store.create_user("Ada").await.unwrap();
        let guest = store.create_user("Grace").await.unwrap();
        let room = store.create_room(owner, "retro").await.unwrap();
        let router = EventRouter::new(store.clone());
        (store, router, room, owner, guest)
    }

    #[test]
    fn parses_item_commands() {
        let created = envelope("create_item_worked", r#"{"content":"X"}"#);
        let command = Command::parse(&created).unwrap();
        assert_eq!(command, create(ItemKind::Worked, "X"));

        let (id, parent) = (Uuid::now_v7(), Uuid::now_v7());
        let command = Command::parse(&envelope(
            "nest_item_question",
            &format!(r#"{{"id":"{id}","parentId":"{parent}"}}"#),
        ))
        .unwrap();
        assert_eq!(command, Command::NestItem { kind: ItemKind::Question, id, parent_id: parent });
    }

    #[test]
    fn promote_owner_takes_a_bare_id() {
        let user_id = Uuid::now_v7();
        let command = Command::parse(&envelope("promote_owner", &user_id.to_string())).unwrap();
        assert_eq!(command, Command::PromoteOwner { user_id });
    }

    #[test]
    fn rejects_unknown_and_malformed_commands() {
        let unknown = Command::parse(&envelope("dance", ""));
        assert!(matches!(unknown, Err(CommandError::Unknown(_))));
        let unknown_kind = Command::parse(&envelope("create_item_feelings", "{}"));
        assert!(matches!(unknown_kind, Err(CommandError::Unknown(_))));
        assert!(matches!(
            Command::parse(&envelope("delete_action", "not json")),
            Err(CommandError::Malformed { .. })
        ));
    }

    #[test]
    fn inbound_envelope_tolerates_missing_fields() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"concede_retrospective"}"#).unwrap();
        assert_eq!(Command::parse(&envelope).unwrap(), Command::Concede);
    }

    #[tokio::test]
    async fn item_created_in_open_phase_is_broadcast() {
        let (_store, router, room, owner, _) = setup().await;

        let outcome = router.route(room, owner, create(ItemKind::Worked, "X")).await.unwrap();

        let (kind, value) = broadcast_value(outcome);
        assert_eq!(kind, "item_worked_updated");
        assert_eq!(value[0]["content"], "X");
        assert_eq!(value[0]["votes"], json!([]));
    }

    #[tokio::test]
    async fn item_created_in_private_phase_is_targeted_and_filtered() {
        let (store, router, room, owner, guest) = setup().await;
        store.create_item(room, owner, ItemKind::Worked, "owner's").await.unwrap();
        store.advance_phase(room, owner, PRIVATE_PHASE).await.unwrap();

        let outcome = router.route(room, guest, create(ItemKind::Worked, "mine")).await.unwrap();

        let (_, value) = targeted_value(outcome);
        assert_eq!(contents(&value), vec!["mine"]);
    }

    #[tokio::test]
    async fn every_item_mutation_in_private_phase_is_targeted_and_filtered() {
        let (store, router, room, owner, guest) = setup().await;
        store.create_item(room, owner, ItemKind::Improve, "owner's").await.unwrap();
        store.create_item(room, guest, ItemKind::Improve, "parent").await.unwrap();
        let items = store.create_item(room, guest, ItemKind::Improve, "child").await.unwrap();
        let (parent, child) = (items.improve[1].id, items.improve[2].id);
        store.advance_phase(room, owner, PRIVATE_PHASE).await.unwrap();

        let nest = Command::NestItem { kind: ItemKind::Improve, id: child, parent_id: parent };
        let (kind, value) = targeted_value(router.route(room, guest, nest).await.unwrap());
        assert_eq!(kind, "item_improve_updated");
        assert_eq!(contents(&value), vec!["parent", "child"]);
        assert_eq!(value[1]["parentId"], parent.to_string());

        let unnest = Command::UnnestItem { kind: ItemKind::Improve, id: child };
        let (_, value) = targeted_value(router.route(room, guest, unnest).await.unwrap());
        assert_eq!(contents(&value), vec!["parent", "child"]);
        assert!(value[1]["parentId"].is_null());

        let delete = Command::DeleteItem { kind: ItemKind::Improve, id: child };
        let (_, value) = targeted_value(router.route(room, guest, delete).await.unwrap());
        assert_eq!(contents(&value), vec!["parent"]);

        // once revealed, the same mutations reach everyone with every author's items
        store.advance_phase(room, owner, 2).await.unwrap();
        let delete = Command::DeleteItem { kind: ItemKind::Improve, id: parent };
        let (_, value) = broadcast_value(router.route(room, guest, delete).await.unwrap());
        assert_eq!(contents(&value), vec!["owner's"]);
    }

    #[tokio::test]
    async fn nest_then_unnest_clears_parent_everywhere() {
        let (store, router, room, owner, _) = setup().await;
        store.create_item(room, owner, ItemKind::Worked, "I1").await.unwrap();
        let items = store.create_item(room, owner, ItemKind::Worked, "I2").await.unwrap();
        let (i1, i2) = (items.worked[0].id, items.worked[1].id);

        let nest = Command::NestItem { kind: ItemKind::Worked, id: i2, parent_id: i1 };
        router.route(room, owner, nest).await.unwrap();
        let unnest = Command::UnnestItem { kind: ItemKind::Worked, id: i2 };
        let outcome = router.route(room, owner, unnest).await.unwrap();

        let (_, value) = broadcast_value(outcome);
        assert!(value[1]["parentId"].is_null());

        let room_state = store.get_room(room).await.unwrap();
        assert_eq!(room_state.worked_items[1].id, i2);
        assert_eq!(room_state.worked_items[1].parent_id, None);
    }

    #[tokio::test]
    async fn action_commands_broadcast_the_action_list() {
        let (_store, router, room, owner, guest) = setup().await;

        let create = Command::CreateAction { content: "ship it".to_owned() };
        let (kind, value) = broadcast_value(router.route(room, owner, create).await.unwrap());
        assert_eq!(kind, "action_updated");
        assert_eq!(value[0]["content"], "ship it");
        assert_eq!(value[0]["completed"], false);
        let id: Uuid = value[0]["id"].as_str().unwrap().parse().unwrap();

        let update = Command::UpdateAction { id, completed: true };
        let (kind, value) = broadcast_value(router.route(room, owner, update).await.unwrap());
        assert_eq!(kind, "action_updated");
        assert_eq!(value.as_array().unwrap().len(), 1);
        assert_eq!(value[0]["completed"], true);

        let denied = router.route(room, guest, Command::DeleteAction { id }).await;
        assert!(matches!(denied, Err(RouteError::Store(StoreError::PermissionDenied))));

        let delete = Command::DeleteAction { id };
        let (kind, value) = broadcast_value(router.route(room, owner, delete).await.unwrap());
        assert_eq!(kind, "action_updated");
        assert_eq!(value, json!([]));
    }

    #[tokio::test]
    async fn owner_commands_from_non_owner_change_nothing() {
        let (store, router, room, owner, guest) = setup().await;

        for command in [
            Command::PromoteOwner { user_id: guest },
            Command::Concede,
            Command::AdvancePhase { phase: 2 },
        ] {
            let result = router.route(room, guest, command).await;
            assert!(matches!(result, Err(RouteError::Store(StoreError::PermissionDenied))));
        }

        let room_state = store.get_room(room).await.unwrap();
        assert_eq!(room_state.owner_id, owner);
        assert_eq!(room_state.phase, 0);
    }

    #[tokio::test]
    async fn owner_commands_broadcast() {
        let (store, router, room, owner, guest) = setup().await;

        let advance = Command::AdvancePhase { phase: 2 };
        let Outcome::Broadcast(payload) = router.route(room, owner, advance).await.unwrap() else {
            panic!("expected broadcast");
        };
        let envelope: Envelope = serde_json::from_str(payload.as_str()).unwrap();
        assert_eq!((envelope.kind.as_str(), envelope.value.as_str()), ("phase_updated", "2"));

        let promote = Command::PromoteOwner { user_id: guest };
        let (kind, value) = broadcast_value(router.route(room, owner, promote).await.unwrap());
        assert_eq!(kind, "retrospective_updated");
        assert_eq!(value["ownerId"], guest.to_string());
        assert!(value.get("workedItems").is_none());

        let (kind, _) = broadcast_value(router.route(room, guest, Command::Concede).await.unwrap());
        assert_eq!(kind, "retrospective_conceded");
        assert!(matches!(store.get_room(room).await, Err(StoreError::RoomNotFound)));
    }

    #[tokio::test]
    async fn abandon_marks_participant() {
        let (store, router, room, _, guest) = setup().await;
        store.add_participant(room, guest).await.unwrap();

        assert_eq!(router.route(room, guest, Command::Abandon).await.unwrap(), Outcome::Abandoned);
        assert!(store.get_participant(room, guest).await.unwrap().abandoned);
    }
}
