//! Room: the unit of fan-out.
//!
//! A room task owns the local membership for one topic and holds the broker
//! subscription of the same name for exactly as long as it runs. Membership
//! changes arrive as commands forwarded by the hub; everything the broker
//! delivers is fanned out to the local members' outbound queues.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::mpsc;

use super::broker::{Broker, Subscription};
use super::connection::{ConnectionHandle, ConnectionId};
use super::types::OutboundMessage;

/// Queue depth for hub-forwarded membership commands.
const ROOM_COMMAND_BUFFER: usize = 64;

pub(crate) enum RoomCommand {
    Register(ConnectionHandle),
    Unregister(ConnectionId),
}

/// Cheap-clone handle to a running room task.
#[derive(Clone)]
pub struct RoomHandle {
    id: Arc<str>,
    commands: mpsc::Sender<RoomCommand>,
    broker: Arc<dyn Broker>,
}

impl RoomHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish an envelope to this room's broker topic. Local members
    /// receive it the same way remote ones do: through the subscription
    /// loop. There is no local shortcut.
    pub async fn publish(&self, message: &OutboundMessage) {
        self.publish_bytes(message.encode()).await;
    }

    /// Publish pre-encoded bytes, keeping the envelope byte-identical when
    /// the same event goes to several rooms.
    pub async fn publish_bytes(&self, payload: Bytes) {
        if let Err(err) = self.broker.publish(&self.id, payload).await {
            warn!("publish to room {} failed: {err:#}", self.id);
        }
    }

    /// Forwarded by the hub only. Returns `false` when the room task is
    /// gone and the hub should mint a replacement.
    pub(crate) async fn register(&self, conn: ConnectionHandle) -> bool {
        self.commands
            .send(RoomCommand::Register(conn))
            .await
            .is_ok()
    }

    pub(crate) async fn unregister(&self, conn_id: ConnectionId) {
        let _ = self.commands.send(RoomCommand::Unregister(conn_id)).await;
    }
}

/// Subscribe to the room's topic and start the room task.
pub(crate) async fn spawn(id: &str, broker: Arc<dyn Broker>) -> anyhow::Result<RoomHandle> {
    let subscription = broker.subscribe(id).await?;
    let (tx, rx) = mpsc::channel(ROOM_COMMAND_BUFFER);
    let id: Arc<str> = Arc::from(id);
    tokio::spawn(run(Arc::clone(&id), rx, subscription));
    Ok(RoomHandle {
        id,
        commands: tx,
        broker,
    })
}

async fn run(
    id: Arc<str>,
    mut commands: mpsc::Receiver<RoomCommand>,
    mut subscription: Subscription,
) {
    let mut members: HashMap<ConnectionId, ConnectionHandle> = HashMap::new();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(RoomCommand::Register(conn)) => {
                    members.insert(conn.id(), conn);
                }
                Some(RoomCommand::Unregister(conn_id)) => {
                    members.remove(&conn_id);
                }
                // hub dropped the handle: the room was retired
                None => break,
            },
            delivery = subscription.recv() => match delivery {
                Some(payload) => broadcast_local(&id, &members, payload),
                None => {
                    warn!("room {id}: broker subscription ended");
                    break;
                }
            },
        }
    }

    debug!("room {id} stopped");
}

/// Enqueue the payload to every local member. A member whose queue is full
/// loses this frame rather than stalling the room.
fn broadcast_local(id: &str, members: &HashMap<ConnectionId, ConnectionHandle>, payload: Bytes) {
    for member in members.values() {
        if !member.enqueue(payload.clone()) {
            warn!(
                "room {id}: dropped frame for slow or closing connection {}",
                member.id()
            );
        }
    }
}
