//! Room fan-out hub.
//!
//! The registry of who listens to which room is owned by a single task. Every
//! register, unregister and broadcast is a message into that task's mailbox,
//! so the map is never shared and broadcasts into one room are delivered in
//! the order they were submitted.
//!
//! Delivery never waits on a subscriber. A subscriber whose outbound queue is
//! full (or already gone) is evicted: it leaves the registry and its
//! connection is cancelled, which runs the normal teardown.

use std::collections::HashMap;

use axum::extract::ws::Utf8Bytes;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::rooms::connection::Outbound;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("user already has a live connection to this room")]
    DuplicateSession,

    #[error("hub is not running")]
    Closed,
}

/// The hub's view of one subscription.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub connection_id: Uuid,
    pub(crate) outbound: mpsc::Sender<Outbound>,
    pub(crate) cancel: CancellationToken,
}

enum HubMessage {
    Register {
        subscriber: Subscriber,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister {
        room_id: Uuid,
        connection_id: Uuid,
    },
    Broadcast {
        room_id: Uuid,
        payload: Utf8Bytes,
    },
    Members {
        room_id: Uuid,
        respond_to: oneshot::Sender<Vec<Uuid>>,
    },
}

/// Cloneable handle to the hub task.
#[derive(Clone)]
pub struct Hub {
    sender: mpsc::Sender<HubMessage>,
}

impl Hub {
    /// Spawns the control loop. It exits once every handle is dropped.
    pub fn spawn(capacity: usize) -> (Hub, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let task = tokio::spawn(HubLoop::new(receiver).run());
        (Hub { sender }, task)
    }

    /// Adds `subscriber` to its room. Once this returns `Ok`, every later
    /// broadcast to the room reaches it.
    ///
    /// Registering the same connection twice is a no-op; a different
    /// connection for an already registered (room, user) pair is refused.
    pub async fn register(&self, subscriber: Subscriber) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubMessage::Register { subscriber, respond_to: tx })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Drops the hub's reference to a connection. Safe for unknown connections.
    pub async fn unregister(&self, room_id: Uuid, connection_id: Uuid) -> Result<(), HubError> {
        self.sender
            .send(HubMessage::Unregister { room_id, connection_id })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn broadcast(&self, room_id: Uuid, payload: Utf8Bytes) -> Result<(), HubError> {
        self.sender
            .send(HubMessage::Broadcast { room_id, payload })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Users currently registered in `room_id`. The handshake uses it to tell a
    /// live duplicate from stale presence. Processed in mailbox order, so it
    /// also acts as a barrier for earlier submissions.
    pub async fn members(&self, room_id: Uuid) -> Result<Vec<Uuid>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubMessage::Members { room_id, respond_to: tx })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

struct HubLoop {
    receiver: mpsc::Receiver<HubMessage>,
    /// room -> user -> subscriber
    rooms: HashMap<Uuid, HashMap<Uuid, Subscriber>>,
}

impl HubLoop {
    fn new(receiver: mpsc::Receiver<HubMessage>) -> Self {
        Self { receiver, rooms: HashMap::new() }
    }

    #[instrument(skip_all, name = "hub")]
    async fn run(mut self) {
        info!("hub started");

        while let Some(message) = self.receiver.recv().await {
            match message {
                HubMessage::Register { subscriber, respond_to } => {
                    let _ = respond_to.send(self.register(subscriber));
                }
                HubMessage::Unregister { room_id, connection_id } => {
                    self.unregister(room_id, connection_id)
                }
                HubMessage::Broadcast { room_id, payload } => self.broadcast(room_id, payload),
                HubMessage::Members { room_id, respond_to } => {
                    let members = self
                        .rooms
                        .get(&room_id)
                        .map(|room| room.keys().copied().collect())
                        .unwrap_or_default();
                    let _ = respond_to.send(members);
                }
            }
        }

        info!(rooms = self.rooms.len(), "hub stopped");
    }

    fn register(&mut self, subscriber: Subscriber) -> Result<(), HubError> {
        let room = self.rooms.entry(subscriber.room_id).or_default();

        if let Some(existing) = room.get(&subscriber.user_id) {
            if existing.connection_id == subscriber.connection_id {
                return Ok(());
            }
            return Err(HubError::DuplicateSession);
        }

        debug!(
            room_id = %subscriber.room_id,
            user_id = %subscriber.user_id,
            connection_id = %subscriber.connection_id,
            room_size = room.len() + 1,
            "subscriber registered"
        );
        room.insert(subscriber.user_id, subscriber);
        Ok(())
    }

    fn unregister(&mut self, room_id: Uuid, connection_id: Uuid) {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };

        // only the exact connection; a newer one for the same user stays
        room.retain(|_, subscriber| subscriber.connection_id != connection_id);
        debug!(%room_id, %connection_id, room_size = room.len(), "subscriber unregistered");

        if room.is_empty() {
            self.rooms.remove(&room_id);
        }
    }

    fn broadcast(&mut self, room_id: Uuid, payload: Utf8Bytes) {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };

        room.retain(|_, subscriber| {
            let Err(e) = subscriber.outbound.try_send(Outbound::Text(payload.clone())) else {
                return true;
            };
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "outbound queue full",
                mpsc::error::TrySendError::Closed(_) => "outbound queue closed",
            };
            warn!(
                %room_id,
                user_id = %subscriber.user_id,
                connection_id = %subscriber.connection_id,
                reason,
                "evicting subscriber"
            );
            subscriber.cancel.cancel();
            false
        });

        if room.is_empty() {
            self.rooms.remove(&room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(
        room_id: Uuid,
        user_id: Uuid,
        capacity: usize,
    ) -> (Subscriber, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let subscriber = Subscriber {
            room_id,
            user_id,
            connection_id: Uuid::now_v7(),
            outbound,
            cancel: CancellationToken::new(),
        };
        (subscriber, rx)
    }

    fn text(outbound: Outbound) -> String {
        match outbound {
            Outbound::Text(text) => text.as_str().to_owned(),
            Outbound::Close(closing) => panic!("unexpected close {closing:?}"),
        }
    }

    #[tokio::test]
    async fn broadcasts_arrive_in_submission_order() {
        let (hub, _task) = Hub::spawn(16);
        let room = Uuid::now_v7();
        let (sub, mut rx) = subscriber(room, Uuid::now_v7(), 64);
        hub.register(sub).await.unwrap();

        for i in 0..20 {
            hub.broadcast(room, format!("m{i}").into()).await.unwrap();
        }
        hub.members(room).await.unwrap();

        for i in 0..20 {
            assert_eq!(text(rx.try_recv().unwrap()), format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn broadcasts_stay_inside_their_room() {
        let (hub, _task) = Hub::spawn(16);
        let (room_a, room_b) = (Uuid::now_v7(), Uuid::now_v7());
        let (sub_a, mut rx_a) = subscriber(room_a, Uuid::now_v7(), 8);
        let (sub_b, mut rx_b) = subscriber(room_b, Uuid::now_v7(), 8);
        hub.register(sub_a).await.unwrap();
        hub.register(sub_b).await.unwrap();

        hub.broadcast(room_a, "hello a".into()).await.unwrap();
        hub.members(room_a).await.unwrap();

        assert_eq!(text(rx_a.try_recv().unwrap()), "hello a");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_connection_for_same_user_is_refused() {
        let (hub, _task) = Hub::spawn(16);
        let (room, user) = (Uuid::now_v7(), Uuid::now_v7());
        let (first, _rx1) = subscriber(room, user, 8);
        let (second, _rx2) = subscriber(room, user, 8);

        hub.register(first.clone()).await.unwrap();
        assert_eq!(hub.register(first.clone()).await, Ok(()));
        assert_eq!(hub.register(second.clone()).await, Err(HubError::DuplicateSession));

        hub.unregister(room, first.connection_id).await.unwrap();
        assert_eq!(hub.register(second).await, Ok(()));
    }

    #[tokio::test]
    async fn stale_unregister_leaves_newer_connection_alone() {
        let (hub, _task) = Hub::spawn(16);
        let (room, user) = (Uuid::now_v7(), Uuid::now_v7());
        let (sub, _rx) = subscriber(room, user, 8);
        hub.register(sub).await.unwrap();

        hub.unregister(room, Uuid::now_v7()).await.unwrap();
        hub.unregister(Uuid::now_v7(), Uuid::now_v7()).await.unwrap();
        assert_eq!(hub.members(room).await.unwrap(), vec![user]);
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_without_stalling_others() {
        let (hub, _task) = Hub::spawn(16);
        let room = Uuid::now_v7();
        let (slow, _slow_rx) = subscriber(room, Uuid::now_v7(), 1);
        let (fast, mut fast_rx) = subscriber(room, Uuid::now_v7(), 16);
        let slow_cancel = slow.cancel.clone();
        let fast_user = fast.user_id;
        hub.register(slow).await.unwrap();
        hub.register(fast).await.unwrap();

        for i in 0..5 {
            hub.broadcast(room, format!("m{i}").into()).await.unwrap();
        }

        assert_eq!(hub.members(room).await.unwrap(), vec![fast_user]);
        assert!(slow_cancel.is_cancelled());
        for i in 0..5 {
            assert_eq!(text(fast_rx.try_recv().unwrap()), format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn dropped_receiver_is_evicted_on_next_broadcast() {
        let (hub, _task) = Hub::spawn(16);
        let room = Uuid::now_v7();
        let (sub, rx) = subscriber(room, Uuid::now_v7(), 4);
        hub.register(sub).await.unwrap();
        drop(rx);

        hub.broadcast(room, "anyone?".into()).await.unwrap();
        assert!(hub.members(room).await.unwrap().is_empty());
    }
}
