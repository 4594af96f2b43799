//! In-memory directory backing the dev server and the test suite.

use std::collections::HashSet;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{ChannelService, GuildService, UserService};

/// One struct implements all three collaborator services, the way a single
/// data layer would behind real storage.
#[derive(Default)]
pub struct MemoryDirectory {
    /// channel id -> member ids
    channels: DashMap<String, HashSet<String>>,
    /// guild id -> member ids
    guilds: DashMap<String, HashSet<String>>,
    /// user id -> friend ids
    friends: DashMap<String, HashSet<String>>,
    online: DashMap<String, bool>,
    last_seen: DashMap<(String, String), DateTime<Utc>>,
    requests: DashMap<String, i64>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&self, channel_id: &str, members: &[&str]) {
        self.channels.insert(
            channel_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn add_guild(&self, guild_id: &str, members: &[&str]) {
        self.guilds.insert(
            guild_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn add_friends(&self, user_id: &str, friends: &[&str]) {
        self.friends.insert(
            user_id.to_string(),
            friends.iter().map(|f| f.to_string()).collect(),
        );
    }

    pub fn set_request_count(&self, user_id: &str, count: i64) {
        self.requests.insert(user_id.to_string(), count);
    }

    pub fn is_online(&self, user_id: &str) -> Option<bool> {
        self.online.get(user_id).map(|v| *v)
    }

    pub fn last_seen(&self, user_id: &str, guild_id: &str) -> Option<DateTime<Utc>> {
        self.last_seen
            .get(&(user_id.to_string(), guild_id.to_string()))
            .map(|v| *v)
    }
}

#[async_trait]
impl ChannelService for MemoryDirectory {
    async fn channel_member(&self, channel_id: &str, user_id: &str) -> Result<bool> {
        let members = self
            .channels
            .get(channel_id)
            .ok_or_else(|| anyhow!("channel {channel_id} not found"))?;
        Ok(members.contains(user_id))
    }
}

#[async_trait]
impl GuildService for MemoryDirectory {
    async fn guild_member(&self, guild_id: &str, user_id: &str) -> Result<bool> {
        let members = self
            .guilds
            .get(guild_id)
            .ok_or_else(|| anyhow!("guild {guild_id} not found"))?;
        Ok(members.contains(user_id))
    }

    async fn update_member_last_seen(&self, user_id: &str, guild_id: &str) -> Result<()> {
        self.last_seen
            .insert((user_id.to_string(), guild_id.to_string()), Utc::now());
        Ok(())
    }
}

#[async_trait]
impl UserService for MemoryDirectory {
    async fn set_online(&self, user_id: &str, online: bool) -> Result<()> {
        self.online.insert(user_id.to_string(), online);
        Ok(())
    }

    async fn friend_and_guild_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .friends
            .get(user_id)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default();

        for entry in self.guilds.iter() {
            if entry.value().contains(user_id) {
                ids.push(entry.key().clone());
            }
        }

        Ok(ids)
    }

    async fn request_count(&self, user_id: &str) -> Result<i64> {
        Ok(self.requests.get(user_id).map(|v| *v).unwrap_or(0))
    }
}
