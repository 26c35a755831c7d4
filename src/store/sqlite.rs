use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    types::Json,
    SqliteConnection, SqlitePool,
};
use tracing::warn;
use uuid::Uuid;

use super::{
    Action, Item, ItemKind, Participant, Room, RoomItems, RoomSummary, Store, StoreError,
    StoreResult,
};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS users (
        id BLOB PRIMARY KEY,
        name TEXT NOT NULL,
        last_active TEXT
    )",
    "CREATE TABLE IF NOT EXISTS rooms (
        id BLOB PRIMARY KEY,
        name TEXT NOT NULL,
        owner_id BLOB NOT NULL,
        phase INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS participants (
        room_id BLOB NOT NULL,
        user_id BLOB NOT NULL,
        active INTEGER NOT NULL DEFAULT 0,
        abandoned INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (room_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS items (
        id BLOB PRIMARY KEY,
        room_id BLOB NOT NULL,
        user_id BLOB NOT NULL,
        parent_id BLOB,
        content TEXT NOT NULL,
        kind TEXT NOT NULL,
        votes TEXT NOT NULL DEFAULT '[]'
    )",
    "CREATE TABLE IF NOT EXISTS actions (
        id BLOB PRIMARY KEY,
        room_id BLOB NOT NULL,
        content TEXT NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0
    )",
];

type ItemRow = (Uuid, Uuid, Option<Uuid>, String, String, Json<Vec<Uuid>>);

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// A private database living in a single pooled connection.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Marks every participant inactive. Nobody is connected at startup, so
    /// presence left over from a previous process would otherwise read as a
    /// duplicate session forever.
    pub async fn reset_presence(&self) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE participants SET active = 0 WHERE active = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// The helpers below run on one connection so that a mutation, its checks and
// the state it returns can share a transaction.

/// Takes the database write lock on behalf of `room_id`. Nothing else can
/// mutate the room until the surrounding transaction ends.
async fn lock_room(conn: &mut SqliteConnection, room_id: Uuid) -> StoreResult<()> {
    let touched = sqlx::query("UPDATE rooms SET phase = phase WHERE id = ?")
        .bind(room_id)
        .execute(&mut *conn)
        .await?;
    if touched.rows_affected() == 0 {
        return Err(StoreError::RoomNotFound);
    }
    Ok(())
}

async fn owner_of(conn: &mut SqliteConnection, room_id: Uuid) -> StoreResult<Uuid> {
    let (owner_id,): (Uuid,) = sqlx::query_as("SELECT owner_id FROM rooms WHERE id = ?")
        .bind(room_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::RoomNotFound)?;
    Ok(owner_id)
}

async fn ensure_owner(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    user_id: Uuid,
) -> StoreResult<()> {
    if owner_of(conn, room_id).await? == user_id {
        Ok(())
    } else {
        Err(StoreError::PermissionDenied)
    }
}

async fn ensure_user(conn: &mut SqliteConnection, user_id: Uuid) -> StoreResult<()> {
    sqlx::query_as::<_, (i64,)>("SELECT 1 FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::UserNotFound)?;
    Ok(())
}

/// All items of a room together with the phase they were read under.
async fn items(conn: &mut SqliteConnection, room_id: Uuid) -> StoreResult<RoomItems> {
    let (phase,): (i64,) = sqlx::query_as("SELECT phase FROM rooms WHERE id = ?")
        .bind(room_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::RoomNotFound)?;

    let rows: Vec<ItemRow> = sqlx::query_as(
        "SELECT id, user_id, parent_id, content, kind, votes
        FROM items WHERE room_id = ? ORDER BY rowid",
    )
    .bind(room_id)
    .fetch_all(&mut *conn)
    .await?;

    let items = rows
        .into_iter()
        .filter_map(|(id, user_id, parent_id, content, kind, Json(votes))| {
            let Some(kind) = ItemKind::parse(&kind) else {
                warn!(%id, kind = %kind, "skipping item with unknown kind");
                return None;
            };
            Some(Item { id, room_id, user_id, parent_id, content, kind, votes })
        })
        .collect();

    Ok(RoomItems::from_items(phase, items))
}

async fn actions(conn: &mut SqliteConnection, room_id: Uuid) -> StoreResult<Vec<Action>> {
    let rows: Vec<(Uuid, String, bool)> = sqlx::query_as(
        "SELECT id, content, completed FROM actions WHERE room_id = ? ORDER BY rowid",
    )
    .bind(room_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, content, completed)| Action { id, room_id, content, completed })
        .collect())
}

async fn participants(conn: &mut SqliteConnection, room_id: Uuid) -> StoreResult<Vec<Participant>> {
    let rows: Vec<(Uuid, String, bool, bool)> = sqlx::query_as(
        "SELECT u.id, u.name, p.active, p.abandoned
        FROM participants p JOIN users u ON u.id = p.user_id
        WHERE p.room_id = ? AND p.abandoned = 0
        ORDER BY p.rowid",
    )
    .bind(room_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(user_id, name, active, abandoned)| Participant { user_id, name, active, abandoned })
        .collect())
}

async fn summary(conn: &mut SqliteConnection, room_id: Uuid) -> StoreResult<RoomSummary> {
    let (name, owner_id, phase): (String, Uuid, i64) =
        sqlx::query_as("SELECT name, owner_id, phase FROM rooms WHERE id = ?")
            .bind(room_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::RoomNotFound)?;

    Ok(RoomSummary {
        id: room_id,
        name,
        owner_id,
        phase,
        users: participants(conn, room_id).await?,
    })
}

async fn touch_user(conn: &mut SqliteConnection, user_id: Uuid) -> StoreResult<()> {
    sqlx::query("UPDATE users SET last_active = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_user(&self, name: &str) -> StoreResult<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO users (id, name, last_active) VALUES (?, ?, CURRENT_TIMESTAMP)")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn create_room(&self, owner_id: Uuid, name: &str) -> StoreResult<Uuid> {
        let mut tx = self.pool.begin().await?;
        ensure_user(&mut tx, owner_id).await?;

        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO rooms (id, name, owner_id, phase) VALUES (?, ?, ?, 0)")
            .bind(id)
            .bind(name)
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn get_room(&self, room_id: Uuid) -> StoreResult<Room> {
        let mut tx = self.pool.begin().await?;
        let summary = summary(&mut tx, room_id).await?;
        let items = items(&mut tx, room_id).await?;
        let actions = actions(&mut tx, room_id).await?;
        tx.commit().await?;

        Ok(Room {
            id: summary.id,
            name: summary.name,
            owner_id: summary.owner_id,
            phase: items.phase,
            users: summary.users,
            worked_items: items.worked,
            improve_items: items.improve,
            question_items: items.question,
            actions,
        })
    }

    async fn list_rooms_for_user(&self, user_id: Uuid) -> StoreResult<Vec<RoomSummary>> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM rooms
            WHERE owner_id = ?
            OR id IN (SELECT room_id FROM participants WHERE user_id = ? AND abandoned = 0)
            ORDER BY rowid",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut rooms = Vec::with_capacity(ids.len());
        for (room_id,) in ids {
            rooms.push(summary(&mut tx, room_id).await?);
        }
        tx.commit().await?;
        Ok(rooms)
    }

    async fn get_participant(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<Participant> {
        let mut conn = self.pool.acquire().await?;
        let (name,): (String,) = sqlx::query_as("SELECT name FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::UserNotFound)?;

        let (active, abandoned): (bool, bool) = sqlx::query_as(
            "SELECT active, abandoned FROM participants WHERE room_id = ? AND user_id = ?",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .unwrap_or((false, false));

        Ok(Participant { user_id, name, active, abandoned })
    }

    async fn list_participants(&self, room_id: Uuid) -> StoreResult<Vec<Participant>> {
        let mut conn = self.pool.acquire().await?;
        participants(&mut conn, room_id).await
    }

    async fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<Vec<Participant>> {
        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;

        sqlx::query(
            "INSERT INTO participants (room_id, user_id, active, abandoned) VALUES (?, ?, 1, 0)
            ON CONFLICT (room_id, user_id) DO UPDATE SET active = 1, abandoned = 0",
        )
        .bind(room_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let users = participants(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(users)
    }

    async fn set_inactive(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<Vec<Participant>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE participants SET active = 0 WHERE room_id = ? AND user_id = ?")
            .bind(room_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        touch_user(&mut tx, user_id).await?;

        let users = participants(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(users)
    }

    async fn set_abandoned(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<Vec<Participant>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE participants SET active = 0, abandoned = 1 WHERE room_id = ? AND user_id = ?",
        )
        .bind(room_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        touch_user(&mut tx, user_id).await?;

        let users = participants(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(users)
    }

    async fn create_item(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        kind: ItemKind,
        content: &str,
    ) -> StoreResult<RoomItems> {
        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;

        sqlx::query(
            "INSERT INTO items (id, room_id, user_id, content, kind) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::now_v7())
        .bind(room_id)
        .bind(user_id)
        .bind(content)
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await?;

        let items = items(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(items)
    }

    async fn delete_item(
        &self,
        room_id: Uuid,
        _user_id: Uuid,
        item_id: Uuid,
    ) -> StoreResult<RoomItems> {
        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;

        let deleted = sqlx::query("DELETE FROM items WHERE id = ? AND room_id = ?")
            .bind(item_id)
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound);
        }

        // children are orphaned, never cascaded
        sqlx::query("UPDATE items SET parent_id = NULL WHERE parent_id = ?")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        let items = items(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(items)
    }

    async fn nest_item(
        &self,
        room_id: Uuid,
        _user_id: Uuid,
        item_id: Uuid,
        parent_id: Uuid,
    ) -> StoreResult<RoomItems> {
        if item_id == parent_id {
            return Err(StoreError::InvalidNesting);
        }

        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;

        let rows: Vec<(Uuid, String, Option<Uuid>)> = sqlx::query_as(
            "SELECT id, kind, parent_id FROM items WHERE room_id = ? AND id IN (?, ?)",
        )
        .bind(room_id)
        .bind(item_id)
        .bind(parent_id)
        .fetch_all(&mut *tx)
        .await?;

        let item = rows.iter().find(|(id, ..)| *id == item_id);
        let parent = rows.iter().find(|(id, ..)| *id == parent_id);
        let (Some((_, item_kind, _)), Some((_, parent_kind, grandparent))) = (item, parent) else {
            return Err(StoreError::ItemNotFound);
        };
        // one level deep, same kind
        if item_kind != parent_kind || grandparent.is_some() {
            return Err(StoreError::InvalidNesting);
        }

        let (children,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items WHERE parent_id = ?")
            .bind(item_id)
            .fetch_one(&mut *tx)
            .await?;
        if children > 0 {
            return Err(StoreError::InvalidNesting);
        }

        sqlx::query("UPDATE items SET parent_id = ? WHERE id = ?")
            .bind(parent_id)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        let items = items(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(items)
    }

    async fn unnest_item(
        &self,
        room_id: Uuid,
        _user_id: Uuid,
        item_id: Uuid,
    ) -> StoreResult<RoomItems> {
        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;

        let updated = sqlx::query("UPDATE items SET parent_id = NULL WHERE id = ? AND room_id = ?")
            .bind(item_id)
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound);
        }

        let items = items(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(items)
    }

    async fn create_action(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        content: &str,
    ) -> StoreResult<Vec<Action>> {
        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;
        ensure_owner(&mut tx, room_id, user_id).await?;

        sqlx::query("INSERT INTO actions (id, room_id, content, completed) VALUES (?, ?, ?, 0)")
            .bind(Uuid::now_v7())
            .bind(room_id)
            .bind(content)
            .execute(&mut *tx)
            .await?;

        let actions = actions(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(actions)
    }

    async fn update_action(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        action_id: Uuid,
        completed: bool,
    ) -> StoreResult<Vec<Action>> {
        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;
        ensure_owner(&mut tx, room_id, user_id).await?;

        let updated = sqlx::query("UPDATE actions SET completed = ? WHERE id = ? AND room_id = ?")
            .bind(completed)
            .bind(action_id)
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::ActionNotFound);
        }

        let actions = actions(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(actions)
    }

    async fn delete_action(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        action_id: Uuid,
    ) -> StoreResult<Vec<Action>> {
        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;
        ensure_owner(&mut tx, room_id, user_id).await?;

        let deleted = sqlx::query("DELETE FROM actions WHERE id = ? AND room_id = ?")
            .bind(action_id)
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::ActionNotFound);
        }

        let actions = actions(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(actions)
    }

    async fn confirm_owner(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(owner_of(&mut conn, room_id).await? == user_id)
    }

    async fn set_owner(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        new_owner_id: Uuid,
    ) -> StoreResult<RoomSummary> {
        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;
        ensure_owner(&mut tx, room_id, user_id).await?;
        ensure_user(&mut tx, new_owner_id).await?;

        sqlx::query("UPDATE rooms SET owner_id = ? WHERE id = ?")
            .bind(new_owner_id)
            .bind(room_id)
            .execute(&mut *tx)
            .await?;

        let summary = summary(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(summary)
    }

    async fn delete_room(&self, room_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;
        ensure_owner(&mut tx, room_id, user_id).await?;

        for statement in [
            "DELETE FROM items WHERE room_id = ?",
            "DELETE FROM actions WHERE room_id = ?",
            "DELETE FROM participants WHERE room_id = ?",
            "DELETE FROM rooms WHERE id = ?",
        ] {
            sqlx::query(statement).bind(room_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn advance_phase(&self, room_id: Uuid, user_id: Uuid, phase: i64) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;
        lock_room(&mut tx, room_id).await?;
        ensure_owner(&mut tx, room_id, user_id).await?;

        sqlx::query("UPDATE rooms SET phase = ? WHERE id = ?")
            .bind(phase)
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(phase)
    }
}
