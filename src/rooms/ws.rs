use std::time::Duration;

use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::StreamExt;
use tower_sessions::Session;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    connection::{self, write, Closing, ConnectionContext, Subscription},
    events::Envelope,
};
use crate::{
    config::ConnectionLimits,
    hub::{Hub, HubError},
    session::{DynValidator, SessionValidator},
    store::{DynStore, Room, Store, StoreError},
    AppState,
};

#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    Path(room_id): Path<Uuid>,
    State(store): State<DynStore>,
    State(hub): State<Hub>,
    State(sessions): State<DynValidator>,
    State(limits): State<ConnectionLimits>,
    session: Session,

    ws: WebSocketUpgrade,
) -> Response {
    // runs before the upgrade so a cleared session reaches the 101 response
    let admission = admit(sessions.as_ref(), store.as_ref(), &hub, &session, room_id).await;
    let ctx = ConnectionContext { hub, store, limits };

    ws.max_message_size(limits.max_message_bytes)
        .on_upgrade(move |socket| async move {
            match admission {
                Ok((user_id, room)) => join(socket, ctx, user_id, room).await,
                Err(closing) => reject(socket, room_id, closing, limits.write_wait).await,
            }
        })
}

/// Decides whether the caller may open a subscription to `room_id`. On
/// success returns the caller and the room as they are allowed to see it.
pub(crate) async fn admit(
    sessions: &dyn SessionValidator,
    store: &dyn Store,
    hub: &Hub,
    session: &Session,
    room_id: Uuid,
) -> Result<(Uuid, Room), Closing> {
    let user_id = sessions.validate(session).await.map_err(|e| {
        debug!(%room_id, error = %e, "no usable session");
        Closing::Unauthorized
    })?;

    let mut room = match store.get_room(room_id).await {
        Ok(room) => room,
        Err(StoreError::RoomNotFound) => return Err(Closing::RoomNotFound),
        Err(e) => {
            warn!(%room_id, error = %e, "room lookup failed");
            return Err(Closing::RoomNotFound);
        }
    };

    match store.get_participant(room_id, user_id).await {
        Ok(participant) if participant.active => {
            // the flag can outlive a connection whose teardown never reached
            // the store; only a live hub subscription is a duplicate
            match hub.members(room_id).await {
                Ok(members) if members.contains(&user_id) => {
                    return Err(Closing::DuplicateSession);
                }
                Ok(_) => debug!(%room_id, %user_id, "ignoring stale presence"),
                Err(e) => {
                    warn!(%room_id, error = %e, "hub unavailable");
                    return Err(Closing::Normal);
                }
            }
        }
        Ok(_) => {}
        Err(StoreError::UserNotFound) => {
            // the session names a user this server never created
            sessions.clear(session).await;
            return Err(Closing::Unauthorized);
        }
        Err(e) => {
            warn!(%room_id, %user_id, error = %e, "participant lookup failed");
            return Err(Closing::DuplicateSession);
        }
    }

    room.privatize_for(user_id);
    Ok((user_id, room))
}

async fn reject(mut socket: WebSocket, room_id: Uuid, closing: Closing, wait: Duration) {
    info!(%room_id, code = closing.code(), reason = closing.reason(), "handshake rejected");
    if let Err(e) = write(&mut socket, closing.frame(), wait).await {
        debug!(error = %e, "failed to send rejection");
    }
}

#[instrument(skip_all, name = "join", fields(room_id = %room.id, %user_id))]
async fn join(socket: WebSocket, ctx: ConnectionContext, user_id: Uuid, mut room: Room) {
    let room_id = room.id;
    let wait = ctx.limits.write_wait;
    let (mut sink, stream) = socket.split();
    let (subscription, outbound) = Subscription::new(room_id, user_id, ctx.limits.send_queue);

    if let Err(e) = ctx.hub.register(subscription.subscriber()).await {
        let closing = match e {
            HubError::DuplicateSession => Closing::DuplicateSession,
            HubError::Closed => Closing::Normal,
        };
        info!(code = closing.code(), error = %e, "handshake rejected");
        let _ = write(&mut sink, closing.frame(), wait).await;
        return;
    }

    match ctx.store.add_participant(room_id, user_id).await {
        Ok(users) => room.users = users,
        Err(e) => {
            warn!(error = %e, "failed to mark participant active");
            let _ = ctx.hub.unregister(room_id, subscription.connection_id()).await;
            let _ = write(&mut sink, Closing::Normal.frame(), wait).await;
            return;
        }
    }

    // the snapshot goes out before the writer starts, so it is always first
    match Envelope::with_json("init", &room, Some(user_id)).and_then(|e| e.encode()) {
        Ok(init) => {
            if let Err(e) = write(&mut sink, Message::Text(init), wait).await {
                // the pumps notice the dead transport and tear down
                debug!(error = %e, "failed to send snapshot");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode snapshot"),
    }

    match Envelope::with_json("user_joined", &room.users, Some(user_id)).and_then(|e| e.encode()) {
        Ok(joined) => {
            if let Err(e) = ctx.hub.broadcast(room_id, joined).await {
                warn!(error = %e, "failed to announce arrival");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode arrival"),
    }

    info!(connection_id = %subscription.connection_id(), "subscription active");
    connection::spawn(subscription, outbound, sink, stream, ctx);
}
