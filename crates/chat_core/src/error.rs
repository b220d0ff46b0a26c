use shared::{
    domain::ChannelUrl,
    error::{BackendError, BackendErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no live session")]
    NotConnected,
    #[error("a connect is already in progress")]
    AlreadyConnecting,
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelUrl),
    #[error("channel already exists: {0}")]
    DuplicateChannel(ChannelUrl),
    #[error("send failed on {channel_url}: {reason}")]
    SendFailed {
        channel_url: ChannelUrl,
        reason: String,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Creation races surface as a unique-constraint violation. Some deployments
/// only report the condition in the message text, so match that too.
pub fn is_duplicate_channel_error(err: &BackendError) -> bool {
    if err.code == BackendErrorCode::UniqueConstraint {
        return true;
    }
    let message = err.message.to_ascii_lowercase();
    message.contains("unique constraint") || message.contains("already exists")
}

pub fn is_not_found_error(err: &BackendError) -> bool {
    err.code == BackendErrorCode::NotFound
}
