use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ChannelUrl, HandlerId, MessageId, UserId},
    error::BackendError,
    protocol::{ChannelSnapshot, ConnectedUser, CreateChannelParams, MessageRecord, PushEvent},
};

/// Callback invoked for every push event routed to a registered handler.
/// Dispatched from the backend's event context inside the async runtime.
pub type EventSink = Arc<dyn Fn(PushEvent) + Send + Sync>;

/// One-shot completion for the callback-based send API.
pub type SendCompletion = Box<dyn FnOnce(Result<MessageRecord, BackendError>) + Send>;

/// Surface of the hosted chat service this crate coordinates.
///
/// Everything here maps one-to-one onto a backend SDK call. The trait is the
/// seam for tests; production embeds an adapter over the real SDK.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn connect(&self, user_id: &UserId) -> Result<ConnectedUser, BackendError>;

    async fn disconnect(&self) -> Result<(), BackendError>;

    async fn update_profile(&self, nickname: &str) -> Result<(), BackendError>;

    /// Channels the connected user belongs to, most recent activity first.
    async fn my_channels(&self, limit: usize) -> Result<Vec<ChannelSnapshot>, BackendError>;

    /// Channels the connected user holds a pending invitation to.
    async fn invited_channels(&self) -> Result<Vec<ChannelSnapshot>, BackendError>;

    async fn get_channel(&self, channel_url: &ChannelUrl)
        -> Result<ChannelSnapshot, BackendError>;

    async fn create_channel(
        &self,
        params: CreateChannelParams,
    ) -> Result<ChannelSnapshot, BackendError>;

    async fn join_channel(
        &self,
        channel_url: &ChannelUrl,
    ) -> Result<ChannelSnapshot, BackendError>;

    async fn invite(
        &self,
        channel_url: &ChannelUrl,
        user_ids: &[UserId],
    ) -> Result<(), BackendError>;

    async fn accept_invitation(&self, channel_url: &ChannelUrl) -> Result<(), BackendError>;

    async fn decline_invitation(&self, channel_url: &ChannelUrl) -> Result<(), BackendError>;

    /// Most recent `limit` messages in chronological order, oldest first.
    async fn previous_messages(
        &self,
        channel_url: &ChannelUrl,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, BackendError>;

    /// Number of members who have not read past the given message.
    async fn unread_member_count(
        &self,
        channel_url: &ChannelUrl,
        message_id: MessageId,
    ) -> Result<u32, BackendError>;

    async fn mark_read(&self, channel_url: &ChannelUrl) -> Result<(), BackendError>;

    /// Fire-and-forget send; the outcome arrives on `done`.
    fn send_message(&self, channel_url: &ChannelUrl, body: &str, done: SendCompletion);

    /// Register a push-event sink under a caller-chosen id.
    fn add_event_handler(&self, handler_id: &HandlerId, sink: EventSink)
        -> Result<(), BackendError>;

    /// Stop routing events to the given id. Unknown ids are ignored.
    fn remove_event_handler(&self, handler_id: &HandlerId);
}
