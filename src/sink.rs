use std::sync::Arc;

use poise::serenity_prelude::{self as serenity};
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum SinkError {
    #[error("discord api error: {0}")]
    Discord(#[from] serenity::Error),
}

/// Outbound side of the engines. Everything headed for the chat platform
/// goes through this trait so the timer and round engines never talk to the
/// Discord API directly. Callers treat every method as best-effort: failures
/// are logged and swallowed, never propagated into a state transition.
#[serenity::async_trait]
pub(crate) trait NotificationSink: Send + Sync {
    async fn send(
        &self,
        guild_id: serenity::GuildId,
        channel_id: serenity::ChannelId,
        text: &str,
    ) -> Result<(), SinkError>;

    /// Apply a permission overwrite for `role_id` on `channel_id`. `None`
    /// clears the overwrite for that permission rather than setting it.
    async fn set_role_permission(
        &self,
        guild_id: serenity::GuildId,
        channel_id: serenity::ChannelId,
        role_id: serenity::RoleId,
        send: Option<bool>,
        read: Option<bool>,
    ) -> Result<(), SinkError>;

    async fn grant_role(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        role_id: serenity::RoleId,
    ) -> Result<(), SinkError>;

    async fn revoke_role(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        role_id: serenity::RoleId,
    ) -> Result<(), SinkError>;
}

pub(crate) struct DiscordSink {
    http: Arc<serenity::Http>,
}

impl DiscordSink {
    pub(crate) fn new(http: Arc<serenity::Http>) -> Self {
        Self { http }
    }
}

#[serenity::async_trait]
impl NotificationSink for DiscordSink {
    async fn send(
        &self,
        _guild_id: serenity::GuildId,
        channel_id: serenity::ChannelId,
        text: &str,
    ) -> Result<(), SinkError> {
        channel_id.say(&self.http, text).await?;
        Ok(())
    }

    async fn set_role_permission(
        &self,
        _guild_id: serenity::GuildId,
        channel_id: serenity::ChannelId,
        role_id: serenity::RoleId,
        send: Option<bool>,
        read: Option<bool>,
    ) -> Result<(), SinkError> {
        let mut allow = serenity::Permissions::empty();
        let mut deny = serenity::Permissions::empty();
        match send {
            Some(true) => allow |= serenity::Permissions::SEND_MESSAGES,
            Some(false) => deny |= serenity::Permissions::SEND_MESSAGES,
            None => {}
        }
        match read {
            Some(true) => allow |= serenity::Permissions::VIEW_CHANNEL,
            Some(false) => deny |= serenity::Permissions::VIEW_CHANNEL,
            None => {}
        }

        channel_id
            .create_permission(
                &self.http,
                serenity::PermissionOverwrite {
                    allow,
                    deny,
                    kind: serenity::PermissionOverwriteType::Role(role_id),
                },
            )
            .await?;
        Ok(())
    }

    async fn grant_role(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        role_id: serenity::RoleId,
    ) -> Result<(), SinkError> {
        self.http
            .add_member_role(guild_id, user_id, role_id, Some("claimed the throne"))
            .await?;
        Ok(())
    }

    async fn revoke_role(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        role_id: serenity::RoleId,
    ) -> Result<(), SinkError> {
        self.http
            .remove_member_role(guild_id, user_id, role_id, Some("lost the throne"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum SinkCall {
        Send {
            channel_id: u64,
            text: String,
        },
        SetRolePermission {
            channel_id: u64,
            role_id: u64,
            send: Option<bool>,
            read: Option<bool>,
        },
        GrantRole {
            user_id: u64,
            role_id: u64,
        },
        RevokeRole {
            user_id: u64,
            role_id: u64,
        },
    }

    /// Records every call for assertions, always succeeds.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        calls: Mutex<Vec<SinkCall>>,
    }

    impl RecordingSink {
        pub(crate) fn calls(&self) -> Vec<SinkCall> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, pred: impl Fn(&SinkCall) -> bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
        }
    }

    #[serenity::async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(
            &self,
            _guild_id: serenity::GuildId,
            channel_id: serenity::ChannelId,
            text: &str,
        ) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(SinkCall::Send {
                channel_id: channel_id.get(),
                text: text.to_owned(),
            });
            Ok(())
        }

        async fn set_role_permission(
            &self,
            _guild_id: serenity::GuildId,
            channel_id: serenity::ChannelId,
            role_id: serenity::RoleId,
            send: Option<bool>,
            read: Option<bool>,
        ) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(SinkCall::SetRolePermission {
                channel_id: channel_id.get(),
                role_id: role_id.get(),
                send,
                read,
            });
            Ok(())
        }

        async fn grant_role(
            &self,
            _guild_id: serenity::GuildId,
            user_id: serenity::UserId,
            role_id: serenity::RoleId,
        ) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(SinkCall::GrantRole {
                user_id: user_id.get(),
                role_id: role_id.get(),
            });
            Ok(())
        }

        async fn revoke_role(
            &self,
            _guild_id: serenity::GuildId,
            user_id: serenity::UserId,
            role_id: serenity::RoleId,
        ) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(SinkCall::RevokeRole {
                user_id: user_id.get(),
                role_id: role_id.get(),
            });
            Ok(())
        }
    }
}
