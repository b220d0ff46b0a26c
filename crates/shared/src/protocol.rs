use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelUrl, MessageId, UserId};

/// Authenticated identity returned by a successful connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedUser {
    pub user_id: UserId,
    pub nickname: String,
    pub connection_handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMember {
    pub user_id: UserId,
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub channel_url: ChannelUrl,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_nickname: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel_url: ChannelUrl,
    pub name: String,
    pub is_distinct: bool,
    pub is_public: bool,
    pub members: Vec<ChannelMember>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageRecord>,
    pub unread_message_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelParams {
    pub channel_url: ChannelUrl,
    pub name: String,
    pub is_public: bool,
    pub is_distinct: bool,
    pub operator_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    /// Free-form metadata stored verbatim with the channel, never read back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Events pushed by the backend to registered handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    MessageReceived {
        channel_url: ChannelUrl,
        message: MessageRecord,
    },
    MessageUpdated {
        channel_url: ChannelUrl,
        message: MessageRecord,
    },
    MessageDeleted {
        channel_url: ChannelUrl,
        message_id: MessageId,
    },
    ChannelChanged {
        channel_url: ChannelUrl,
    },
    MemberJoined {
        channel_url: ChannelUrl,
        user_id: UserId,
    },
    MemberLeft {
        channel_url: ChannelUrl,
        user_id: UserId,
    },
    InvitationReceived {
        channel_url: ChannelUrl,
        inviter_id: UserId,
        invitee_ids: Vec<UserId>,
    },
    InvitationDeclined {
        channel_url: ChannelUrl,
        invitee_id: UserId,
    },
}

impl PushEvent {
    pub fn channel_url(&self) -> &ChannelUrl {
        match self {
            PushEvent::MessageReceived { channel_url, .. }
            | PushEvent::MessageUpdated { channel_url, .. }
            | PushEvent::MessageDeleted { channel_url, .. }
            | PushEvent::ChannelChanged { channel_url }
            | PushEvent::MemberJoined { channel_url, .. }
            | PushEvent::MemberLeft { channel_url, .. }
            | PushEvent::InvitationReceived { channel_url, .. }
            | PushEvent::InvitationDeclined { channel_url, .. } => channel_url,
        }
    }

    /// True for events that affect what a channel list should display.
    pub fn is_channel_level(&self) -> bool {
        !matches!(
            self,
            PushEvent::InvitationReceived { .. } | PushEvent::InvitationDeclined { .. }
        )
    }
}
