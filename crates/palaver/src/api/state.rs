//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::config::WsConfig;
use crate::social::{ChannelService, GuildService, UserService};
use crate::ws::{Broker, HubHandle};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Handle to the hub task; the single entry point for connection and
    /// room bookkeeping.
    pub hub: HubHandle,
    /// Channel membership checks.
    pub channels: Arc<dyn ChannelService>,
    /// Guild membership checks and last-seen updates.
    pub guilds: Arc<dyn GuildService>,
    /// Presence, social graph, and request counts.
    pub users: Arc<dyn UserService>,
    /// Authentication state.
    pub auth: AuthState,
    /// Socket-path tuning, fixed at startup.
    pub ws: Arc<WsConfig>,
}

impl AppState {
    /// Create application state and start the hub task on `broker`.
    pub fn new(
        broker: Arc<dyn Broker>,
        channels: Arc<dyn ChannelService>,
        guilds: Arc<dyn GuildService>,
        users: Arc<dyn UserService>,
        auth: AuthState,
        ws: WsConfig,
    ) -> Self {
        let hub = HubHandle::spawn(broker, ws.idle_room_grace());
        Self {
            hub,
            channels,
            guilds,
            users,
            auth,
            ws: Arc::new(ws),
        }
    }
}
