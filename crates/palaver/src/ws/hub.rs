//! Hub: process-wide connection registry and room factory.
//!
//! The hub task owns the set of live connections and the room index. Joins
//! and leaves are serialized through it, which is what makes room minting
//! and idle-room retirement race-free: the emptiness check never competes
//! with a concurrent join, because both are commands consumed one at a time
//! by the same loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use super::broker::Broker;
use super::connection::{ConnectionHandle, ConnectionId};
use super::room::{self, RoomHandle};
use super::types::OutboundMessage;

const HUB_COMMAND_BUFFER: usize = 256;

enum HubCommand {
    Register(ConnectionHandle),
    Unregister(ConnectionId),
    Join {
        room_id: String,
        conn: ConnectionHandle,
    },
    Leave {
        room_id: String,
        conn_id: ConnectionId,
    },
    FindRoom {
        room_id: String,
        reply: oneshot::Sender<Option<RoomHandle>>,
    },
    BroadcastGlobal(Bytes),
    SweepRoom {
        room_id: String,
        epoch: u64,
    },
    Counts {
        reply: oneshot::Sender<(usize, usize)>,
    },
}

/// Cheap-clone handle to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Start the hub task. `idle_room_grace` is how long an empty room
    /// lingers (broker subscription included) before it is retired; a
    /// rejoin inside the window reuses the live room.
    pub fn spawn(broker: Arc<dyn Broker>, idle_room_grace: Duration) -> Self {
        let (tx, rx) = mpsc::channel(HUB_COMMAND_BUFFER);
        let hub = Hub {
            broker,
            idle_room_grace,
            commands: tx.clone(),
            connections: HashMap::new(),
            rooms: HashMap::new(),
        };
        tokio::spawn(hub.run(rx));
        Self { commands: tx }
    }

    /// Add a connection to the live set.
    pub async fn register(&self, conn: ConnectionHandle) {
        let _ = self.commands.send(HubCommand::Register(conn)).await;
    }

    /// Remove a connection from the live set. Safe if already absent.
    pub async fn unregister(&self, conn_id: ConnectionId) {
        let _ = self.commands.send(HubCommand::Unregister(conn_id)).await;
    }

    /// Join a room, minting it (and its broker subscription) on first use.
    pub async fn join(&self, room_id: &str, conn: ConnectionHandle) {
        let _ = self
            .commands
            .send(HubCommand::Join {
                room_id: room_id.to_string(),
                conn,
            })
            .await;
    }

    /// Leave a room. Safe if the room is gone or was never joined.
    pub async fn leave(&self, room_id: &str, conn_id: ConnectionId) {
        let _ = self
            .commands
            .send(HubCommand::Leave {
                room_id: room_id.to_string(),
                conn_id,
            })
            .await;
    }

    /// Look a room up without creating it.
    pub async fn room(&self, room_id: &str) -> Option<RoomHandle> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::FindRoom {
                room_id: room_id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Publish to a room's topic if the room exists here. This is the
    /// emission seam the HTTP layer calls after persisting a change.
    pub async fn publish_to_room(&self, room_id: &str, message: &OutboundMessage) {
        if let Some(room) = self.room(room_id).await {
            room.publish(message).await;
        }
    }

    /// Enqueue an envelope to every live connection, regardless of rooms.
    pub async fn broadcast_global(&self, message: &OutboundMessage) {
        let _ = self
            .commands
            .send(HubCommand::BroadcastGlobal(message.encode()))
            .await;
    }

    /// Live connection count.
    pub async fn connection_count(&self) -> usize {
        self.counts().await.0
    }

    /// Live room count.
    pub async fn room_count(&self) -> usize {
        self.counts().await.1
    }

    async fn counts(&self) -> (usize, usize) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(HubCommand::Counts { reply })
            .await
            .is_err()
        {
            return (0, 0);
        }
        rx.await.unwrap_or((0, 0))
    }
}

struct RoomEntry {
    handle: RoomHandle,
    members: HashSet<ConnectionId>,
    /// Bumped each time the room empties; stale sweep timers check it.
    epoch: u64,
}

struct Hub {
    broker: Arc<dyn Broker>,
    idle_room_grace: Duration,
    commands: mpsc::Sender<HubCommand>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    rooms: HashMap<String, RoomEntry>,
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                HubCommand::Register(conn) => {
                    debug!("connection {} registered ({})", conn.id(), conn.principal());
                    self.connections.insert(conn.id(), conn);
                }
                HubCommand::Unregister(conn_id) => {
                    if self.connections.remove(&conn_id).is_some() {
                        debug!("connection {conn_id} unregistered");
                    }
                }
                HubCommand::Join { room_id, conn } => self.join(room_id, conn).await,
                HubCommand::Leave { room_id, conn_id } => self.leave(&room_id, conn_id).await,
                HubCommand::FindRoom { room_id, reply } => {
                    let handle = self.rooms.get(&room_id).map(|e| e.handle.clone());
                    let _ = reply.send(handle);
                }
                HubCommand::BroadcastGlobal(payload) => self.broadcast_global(payload),
                HubCommand::SweepRoom { room_id, epoch } => self.sweep(&room_id, epoch),
                HubCommand::Counts { reply } => {
                    let _ = reply.send((self.connections.len(), self.rooms.len()));
                }
            }
        }
        debug!("hub stopped");
    }

    async fn join(&mut self, room_id: String, conn: ConnectionHandle) {
        // Second pass replaces a room whose task died under us.
        for _ in 0..2 {
            if !self.rooms.contains_key(&room_id) {
                match room::spawn(&room_id, Arc::clone(&self.broker)).await {
                    Ok(handle) => {
                        info!("created room {room_id}");
                        self.rooms.insert(
                            room_id.clone(),
                            RoomEntry {
                                handle,
                                members: HashSet::new(),
                                epoch: 0,
                            },
                        );
                    }
                    Err(err) => {
                        warn!("could not open room {room_id}: {err:#}");
                        return;
                    }
                }
            }

            let Some(entry) = self.rooms.get_mut(&room_id) else {
                return;
            };
            if entry.handle.register(conn.clone()).await {
                entry.members.insert(conn.id());
                return;
            }

            warn!("room {room_id} task is gone, recreating");
            self.rooms.remove(&room_id);
        }
    }

    async fn leave(&mut self, room_id: &str, conn_id: ConnectionId) {
        let emptied = {
            let Some(entry) = self.rooms.get_mut(room_id) else {
                return;
            };
            entry.members.remove(&conn_id);
            entry.handle.unregister(conn_id).await;
            entry.members.is_empty().then(|| {
                entry.epoch += 1;
                entry.epoch
            })
        };
        if let Some(epoch) = emptied {
            self.schedule_sweep(room_id.to_string(), epoch);
        }
    }

    fn schedule_sweep(&self, room_id: String, epoch: u64) {
        let commands = self.commands.clone();
        let grace = self.idle_room_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = commands.send(HubCommand::SweepRoom { room_id, epoch }).await;
        });
    }

    /// Retire the room if it is still empty and no later emptiness rearmed
    /// the timer. Dropping the handle ends the room task and releases its
    /// broker subscription.
    fn sweep(&mut self, room_id: &str, epoch: u64) {
        let retire = self
            .rooms
            .get(room_id)
            .is_some_and(|e| e.members.is_empty() && e.epoch == epoch);
        if retire {
            self.rooms.remove(room_id);
            info!("retired idle room {room_id}");
        }
    }

    fn broadcast_global(&self, payload: Bytes) {
        for conn in self.connections.values() {
            if !conn.enqueue(payload.clone()) {
                warn!(
                    "global broadcast dropped for slow or closing connection {}",
                    conn.id()
                );
            }
        }
    }
}
