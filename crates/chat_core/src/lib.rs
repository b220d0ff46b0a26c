use std::sync::Arc;

use shared::domain::{ChannelUrl, UserId};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

pub mod backend;
pub mod config;
pub mod error;
mod directory;
mod registry;
mod session;
mod sync;

pub use backend::{ChatBackend, EventSink, SendCompletion};
pub use config::ClientConfig;
pub use directory::{pairwise_channel_url, ChannelDirectory, ChannelRef};
pub use error::{ChatError, ChatResult};
pub use registry::{MessageSink, RefreshSignal, SubscriptionKey, SubscriptionRegistry};
pub use session::{Session, SessionManager};
pub use sync::{Message, MessageSynchronizer, ReadStatus};

/// Live handle for one focused channel.
pub struct OpenChannel {
    pub channel: ChannelRef,
    /// Most recent page, oldest first.
    pub history: Vec<Message>,
    /// Messages pushed while the channel stays open.
    pub updates: mpsc::UnboundedReceiver<Message>,
}

/// Coordinates one user's session against a hosted chat backend: channel
/// membership, event subscriptions, and per-channel message state.
///
/// One instance per process. All components are wired here and share the
/// given backend.
pub struct ChatClient {
    config: ClientConfig,
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionManager>,
    directory: Arc<ChannelDirectory>,
    synchronizer: Arc<MessageSynchronizer>,
    list_changed: broadcast::Sender<()>,
}

impl ChatClient {
    pub fn new(backend: Arc<dyn ChatBackend>, config: ClientConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&backend)));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&backend),
            Arc::clone(&registry),
        ));
        let directory = Arc::new(ChannelDirectory::new(
            Arc::clone(&backend),
            Arc::clone(&sessions),
            config.clone(),
        ));
        let synchronizer = Arc::new(MessageSynchronizer::new(backend, Arc::clone(&sessions)));
        let (list_changed, _) = broadcast::channel(16);
        Self {
            config,
            registry,
            sessions,
            directory,
            synchronizer,
            list_changed,
        }
    }

    /// Connect, subscribe, and reconcile channel membership.
    ///
    /// Returns the existing session untouched when one is already live.
    /// Listeners go live before the reconciliation pass so an invitation
    /// raced during pairing is never missed. A failed reconciliation tears
    /// the fresh session back down.
    pub async fn start_session(
        &self,
        user_id: UserId,
        display_name: &str,
    ) -> ChatResult<Session> {
        if let Ok(existing) = self.sessions.session() {
            return Ok(existing);
        }
        let session = self.sessions.start(user_id, display_name).await?;

        self.directory.clear();
        self.synchronizer.clear();

        self.registry
            .attach_invitation_listener(Arc::clone(&self.directory));
        let list_changed = self.list_changed.clone();
        self.registry.attach_global(Arc::new(move || {
            let _ = list_changed.send(());
        }));

        if let Err(err) = self.reconcile_channels().await {
            warn!(error = %err, "client: initial channel reconciliation failed");
            if let Err(stop_err) = self.sessions.stop().await {
                warn!(error = %stop_err, "client: teardown after failed start failed");
            }
            return Err(err);
        }

        Ok(session)
    }

    async fn reconcile_channels(&self) -> ChatResult<()> {
        self.directory.ensure_shared_channel().await?;
        let peers = self.directory.known_peers().await?;
        self.directory.ensure_pairwise_channels(&peers).await?;
        Ok(())
    }

    /// Detach every subscription and disconnect. No-op without a session.
    pub async fn stop_session(&self) -> ChatResult<()> {
        self.sessions.stop().await
    }

    pub async fn list_channels(&self) -> ChatResult<Vec<ChannelRef>> {
        self.directory.list_channels().await
    }

    /// Load history, subscribe to live messages, and mark the channel read.
    ///
    /// Pushed messages are merged into the channel's list, trigger a read
    /// receipt (an open channel is a focused one), and stream out on
    /// `updates` until `close_channel` or session teardown.
    pub async fn open_channel(&self, channel_url: &ChannelUrl) -> ChatResult<OpenChannel> {
        let channel = self.directory.get_channel(channel_url).await?;
        let history = self
            .synchronizer
            .load_history(channel_url, self.config.history_page_size)
            .await?;

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let synchronizer = Arc::clone(&self.synchronizer);
        let url = channel_url.clone();
        self.registry.attach_channel(
            channel_url,
            Arc::new(move |record| {
                let Some(message) = synchronizer.merge_incoming(&url, record) else {
                    return;
                };
                let _ = update_tx.send(message);
                let synchronizer = Arc::clone(&synchronizer);
                let url = url.clone();
                tokio::spawn(async move {
                    if let Err(err) = synchronizer.mark_read(&url).await {
                        warn!(channel_url = %url, error = %err, "client: mark read after receive failed");
                    }
                });
            }),
        );

        if let Err(err) = self.synchronizer.mark_read(channel_url).await {
            warn!(channel_url = %channel_url, error = %err, "client: mark read on open failed");
        }

        Ok(OpenChannel {
            channel,
            history,
            updates: update_rx,
        })
    }

    /// Stop routing live messages for the channel. Unknown urls are a no-op.
    pub fn close_channel(&self, channel_url: &ChannelUrl) {
        self.registry
            .detach(&SubscriptionKey::Channel(channel_url.clone()));
    }

    pub async fn send_message(&self, channel_url: &ChannelUrl, body: &str) -> ChatResult<Message> {
        self.synchronizer.send(channel_url, body).await
    }

    /// Read receipt for scroll interactions on a focused channel.
    pub async fn mark_channel_read(&self, channel_url: &ChannelUrl) -> ChatResult<()> {
        self.synchronizer.mark_read(channel_url).await
    }

    pub async fn read_status(
        &self,
        channel_url: &ChannelUrl,
        message: &Message,
    ) -> ChatResult<ReadStatus> {
        self.synchronizer.compute_read_status(channel_url, message).await
    }

    /// Fires whenever any channel-level event suggests re-fetching the list.
    pub fn subscribe_channel_list_changed(&self) -> broadcast::Receiver<()> {
        self.list_changed.subscribe()
    }

    pub fn session(&self) -> ChatResult<Session> {
        self.sessions.session()
    }

    pub fn is_connected(&self) -> bool {
        self.sessions.is_connected()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &ChannelDirectory {
        &self.directory
    }

    pub fn synchronizer(&self) -> &MessageSynchronizer {
        &self.synchronizer
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
