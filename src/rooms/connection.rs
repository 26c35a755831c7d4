//! One live socket bound to a (room, user) pair.
//!
//! Each connection runs two tasks. The reader enforces the size limit and
//! read deadline and routes commands. The writer drains the outbound queue,
//! sends heartbeats and owns the close frame. When the reader stops, for any
//! reason, the subscription is torn down exactly once: participant marked
//! inactive, "user_retreated" broadcast, hub unregister. Releasing the last
//! queue sender then lets the writer close the socket.

use std::fmt::Display;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::events::{Command, Envelope, EventRouter, Outcome, RouteError};
use crate::{
    config::ConnectionLimits,
    hub::{Hub, Subscriber},
    store::{DynStore, Participant, Store, StoreError},
};

/// How a subscription ended. Everything but `Normal` and `Abandoned` is a
/// handshake rejection, sent before the subscription ever becomes active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closing {
    Normal,
    Unauthorized,
    Abandoned,
    DuplicateSession,
    RoomNotFound,
}

impl Closing {
    pub fn code(&self) -> u16 {
        use Closing::*;
        match self {
            Normal => 1000,
            Unauthorized => 4001,
            Abandoned => 4002,
            DuplicateSession => 4003,
            RoomNotFound => 4004,
        }
    }

    pub fn reason(&self) -> &'static str {
        use Closing::*;
        match self {
            Normal => "",
            Unauthorized => "unauthorized",
            Abandoned => "abandoned",
            DuplicateSession => "duplicate session",
            RoomNotFound => "retrospective not found",
        }
    }

    pub fn frame(&self) -> Message {
        Message::Close(Some(CloseFrame {
            code: self.code(),
            reason: self.reason().into(),
        }))
    }
}

/// Entries of a connection's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    Text(Utf8Bytes),
    Close(Closing),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("write deadline expired")]
    Deadline,
}

/// Shared services a connection needs after the handshake.
#[derive(Clone)]
pub struct ConnectionContext {
    pub hub: Hub,
    pub store: DynStore,
    pub limits: ConnectionLimits,
}

pub struct Subscription {
    room_id: Uuid,
    user_id: Uuid,
    connection_id: Uuid,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    /// Close frame the writer sends when cancelled; `Normal` if unset.
    reason: Arc<OnceLock<Closing>>,
}

impl Subscription {
    pub fn new(
        room_id: Uuid,
        user_id: Uuid,
        capacity: usize,
    ) -> (Subscription, mpsc::Receiver<Outbound>) {
        let (outbound, receiver) = mpsc::channel(capacity);
        let subscription = Subscription {
            room_id,
            user_id,
            connection_id: Uuid::now_v7(),
            outbound,
            cancel: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        };
        (subscription, receiver)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// The handle registered with the hub.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber {
            room_id: self.room_id,
            user_id: self.user_id,
            connection_id: self.connection_id,
            outbound: self.outbound.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Queues `outbound` for this socket only. A full queue means the peer is
    /// not keeping up, which ends the connection.
    fn send_private(&self, outbound: Outbound) {
        if let Err(e) = self.outbound.try_send(outbound) {
            warn!(
                connection_id = %self.connection_id,
                error = %e,
                "outbound queue rejected private message"
            );
            self.cancel.cancel();
        }
    }

    /// Ends the connection with `closing`. The frame is queued behind pending
    /// messages, or sent by the writer straight away if the queue is full.
    fn close_with(&self, closing: Closing) {
        let _ = self.reason.set(closing);
        self.send_private(Outbound::Close(closing));
    }

    async fn dispatch(&self, router: &EventRouter, hub: &Hub, data: &[u8]) -> Option<Closing> {
        let envelope: Envelope = match serde_json::from_slice(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "ignoring undecodable message");
                return None;
            }
        };

        let command = match Command::parse(&envelope) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, "ignoring command");
                return None;
            }
        };

        match router.route(self.room_id, self.user_id, command).await {
            Ok(Outcome::Broadcast(payload)) => {
                if let Err(e) = hub.broadcast(self.room_id, payload).await {
                    warn!(error = %e, "broadcast failed");
                }
                None
            }
            Ok(Outcome::Targeted(payload)) => {
                self.send_private(Outbound::Text(payload));
                None
            }
            Ok(Outcome::Abandoned) => {
                self.close_with(Closing::Abandoned);
                Some(Closing::Abandoned)
            }
            Err(RouteError::Store(StoreError::Database(e))) => {
                warn!(command = %envelope.kind, error = %e, "command failed");
                None
            }
            Err(e) => {
                debug!(command = %envelope.kind, error = %e, "command rejected");
                None
            }
        }
    }

    async fn read_pump<St, E>(&self, mut stream: St, ctx: &ConnectionContext) -> Closing
    where
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let router = EventRouter::new(ctx.store.clone());
        let mut deadline = Instant::now() + ctx.limits.pong_wait;

        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("connection cancelled");
                    return Closing::Normal;
                }
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    debug!("read deadline expired");
                    return Closing::Normal;
                }
                Ok(None) => return Closing::Normal,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "read failed");
                    return Closing::Normal;
                }
                Ok(Some(Ok(message))) => message,
            };

            match &message {
                Message::Pong(_) => {
                    deadline = Instant::now() + ctx.limits.pong_wait;
                    continue;
                }
                Message::Ping(_) => continue,
                Message::Close(_) => return Closing::Normal,
                Message::Text(_) | Message::Binary(_) => {}
            }

            let data = message.into_data();
            if data.len() > ctx.limits.max_message_bytes {
                warn!(size = data.len(), "inbound message over limit");
                return Closing::Normal;
            }

            if let Some(closing) = self.dispatch(&router, &ctx.hub, &data).await {
                return closing;
            }
        }
    }

    /// Marks the participant inactive, retrying once, and returns the room's
    /// members. A store that stays unavailable still yields a member list,
    /// possibly empty, so the departure is always announced.
    async fn depart(&self, store: &dyn Store) -> Vec<Participant> {
        for attempt in 1..=2 {
            match store.set_inactive(self.room_id, self.user_id).await {
                Ok(users) => return users,
                Err(e) => warn!(attempt, error = %e, "failed to mark participant inactive"),
            }
        }

        store.list_participants(self.room_id).await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to list participants");
            vec![]
        })
    }

    async fn teardown(self, ctx: &ConnectionContext) {
        let users = self.depart(ctx.store.as_ref()).await;
        let departure = Envelope::with_json("user_retreated", &users, Some(self.user_id));
        match departure.and_then(|e| e.encode()) {
            Ok(payload) => {
                if let Err(e) = ctx.hub.broadcast(self.room_id, payload).await {
                    warn!(error = %e, "failed to announce departure");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode departure"),
        }

        if let Err(e) = ctx.hub.unregister(self.room_id, self.connection_id).await {
            warn!(error = %e, "failed to unregister");
        }
        debug!("subscription closed");
    }
}

/// Starts the reader and writer for an active subscription. The returned
/// handle resolves after teardown has finished.
pub fn spawn<Si, St, E>(
    subscription: Subscription,
    outbound: mpsc::Receiver<Outbound>,
    sink: Si,
    stream: St,
    ctx: ConnectionContext,
) -> JoinHandle<Closing>
where
    Si: Sink<Message> + Send + Unpin + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(write_pump(
        sink,
        outbound,
        subscription.cancel.clone(),
        subscription.reason.clone(),
        ctx.limits,
        subscription.connection_id,
    ));

    tokio::spawn(run_reader(subscription, stream, ctx))
}

#[instrument(
    skip_all,
    name = "connection",
    fields(
        room_id = %subscription.room_id,
        user_id = %subscription.user_id,
        connection_id = %subscription.connection_id
    )
)]
async fn run_reader<St, E>(
    subscription: Subscription,
    stream: St,
    ctx: ConnectionContext,
) -> Closing
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let closing = subscription.read_pump(stream, &ctx).await;
    subscription.teardown(&ctx).await;
    closing
}

async fn write_pump<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    reason: Arc<OnceLock<Closing>>,
    limits: ConnectionLimits,
    connection_id: Uuid,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let ping_period = limits.ping_period();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    let final_frame = || reason.get().copied().unwrap_or(Closing::Normal).frame();

    loop {
        let (message, last) = tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound::Text(text)) => (Message::Text(text), false),
                Some(Outbound::Close(closing)) => (closing.frame(), true),
                None => (final_frame(), true),
            },
            _ = heartbeat.tick() => (Message::Ping(Bytes::new()), false),
            () = cancel.cancelled() => (final_frame(), true),
        };

        if let Err(e) = write(&mut sink, message, limits.write_wait).await {
            debug!(%connection_id, error = %e, "write failed");
            break;
        }
        if last {
            break;
        }
    }

    // a dead writer means a dead connection
    cancel.cancel();
}

pub(crate) async fn write<Si>(
    sink: &mut Si,
    message: Message,
    wait: Duration,
) -> Result<(), WriteError>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    match tokio::time::timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Transport(e.to_string())),
        Err(_) => Err(WriteError::Deadline),
    }
}
