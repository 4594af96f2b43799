//! Collaborator boundary: the data-layer lookups the hub consumes.
//!
//! Guild/channel/friend persistence lives in another part of the system;
//! the hub only needs the handful of calls below. Each is a plain async
//! call returning a value or an error, and every caller treats an error as
//! "drop silently" per the fail-silent contract of the socket path.

mod memory;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryDirectory;

#[async_trait]
pub trait ChannelService: Send + Sync {
    /// Whether `user_id` may join the channel's room. Unknown channels are
    /// an error, not `false`.
    async fn channel_member(&self, channel_id: &str, user_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait GuildService: Send + Sync {
    /// Whether `user_id` belongs to the guild. Unknown guilds are an error.
    async fn guild_member(&self, guild_id: &str, user_id: &str) -> Result<bool>;

    /// Record when the member last looked at the guild.
    async fn update_member_last_seen(&self, user_id: &str, guild_id: &str) -> Result<()>;
}

#[async_trait]
pub trait UserService: Send + Sync {
    /// Persist the user's online/offline flag.
    async fn set_online(&self, user_id: &str, online: bool) -> Result<()>;

    /// Ids of everyone who should see the user's presence changes: the
    /// personal rooms of their friends plus their guild rooms.
    async fn friend_and_guild_ids(&self, user_id: &str) -> Result<Vec<String>>;

    /// Pending friend-request count.
    async fn request_count(&self, user_id: &str) -> Result<i64>;
}
