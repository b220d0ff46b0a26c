use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use shared::{
    domain::{ChannelUrl, HandlerId},
    protocol::{MessageRecord, PushEvent},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{ChatBackend, EventSink},
    directory::ChannelDirectory,
};

/// Fired when the channel list should be re-fetched.
pub type RefreshSignal = Arc<dyn Fn() + Send + Sync>;

/// Fired for every message received on a subscribed channel.
pub type MessageSink = Arc<dyn Fn(MessageRecord) + Send + Sync>;

/// Identifies one subscription slot. At most one live handler per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Global,
    Invitation,
    Channel(ChannelUrl),
}

/// Tracks which push-event handlers are registered with the backend and
/// routes events to their callbacks.
///
/// Attaching a key that is already subscribed removes the old handler before
/// installing the new one, so the backend never dispatches to a replaced
/// callback. Concurrent attaches to one key serialize on the handler map;
/// exactly one handler survives.
pub struct SubscriptionRegistry {
    backend: Arc<dyn ChatBackend>,
    handlers: Mutex<HashMap<SubscriptionKey, HandlerId>>,
    refresh: Arc<Mutex<Option<RefreshSignal>>>,
}

impl SubscriptionRegistry {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            handlers: Mutex::new(HashMap::new()),
            refresh: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to every channel-level event and collapse them into a single
    /// refresh signal. Replaces any existing global subscription.
    pub fn attach_global(&self, on_change: RefreshSignal) -> HandlerId {
        // guard spans the install below so the slot and the live handler
        // always come from the same call
        let mut refresh = self.refresh.lock().expect("refresh slot lock poisoned");
        *refresh = Some(on_change.clone());

        let sink: EventSink = Arc::new(move |event| {
            if event.is_channel_level() {
                on_change();
            }
        });
        self.install(SubscriptionKey::Global, "global", sink)
    }

    /// Subscribe to invitation events. Received invitations trigger an
    /// accept-all pass on the directory followed by the refresh signal;
    /// declines are logged only. Replaces any existing invitation
    /// subscription.
    pub fn attach_invitation_listener(&self, directory: Arc<ChannelDirectory>) -> HandlerId {
        let refresh = Arc::clone(&self.refresh);

        let sink: EventSink = Arc::new(move |event| match event {
            PushEvent::InvitationReceived {
                channel_url,
                inviter_id,
                ..
            } => {
                info!(
                    channel_url = %channel_url,
                    inviter_id = %inviter_id,
                    "registry: invitation received"
                );
                let directory = Arc::clone(&directory);
                let refresh = Arc::clone(&refresh);
                tokio::spawn(async move {
                    match directory.accept_all_pending_invitations().await {
                        Ok(accepted) => {
                            info!(accepted, "registry: pending invitations accepted")
                        }
                        Err(err) => {
                            warn!(error = %err, "registry: invitation accept pass failed")
                        }
                    }
                    let signal = refresh.lock().expect("refresh slot lock poisoned").clone();
                    if let Some(signal) = signal {
                        signal();
                    }
                });
            }
            PushEvent::InvitationDeclined {
                channel_url,
                invitee_id,
            } => {
                info!(
                    channel_url = %channel_url,
                    invitee_id = %invitee_id,
                    "registry: invitation declined"
                );
            }
            _ => {}
        });
        self.install(SubscriptionKey::Invitation, "invitation", sink)
    }

    /// Subscribe to messages for one channel. Events carrying any other url
    /// are dropped before they reach `on_message`. Replaces any existing
    /// subscription for this url.
    pub fn attach_channel(&self, channel_url: &ChannelUrl, on_message: MessageSink) -> HandlerId {
        let url = channel_url.clone();
        let sink: EventSink = Arc::new(move |event| {
            if let PushEvent::MessageReceived {
                channel_url: event_url,
                message,
            } = event
            {
                if event_url != url {
                    debug!(
                        channel_url = %url,
                        event_url = %event_url,
                        "registry: dropping message for other channel"
                    );
                    return;
                }
                on_message(message);
            }
        });
        self.install(
            SubscriptionKey::Channel(channel_url.clone()),
            "channel",
            sink,
        )
    }

    fn install(&self, key: SubscriptionKey, prefix: &str, sink: EventSink) -> HandlerId {
        // held across the whole swap; both backend hooks are synchronous
        let mut handlers = self.handlers.lock().expect("handler map lock poisoned");
        if let Some(old) = handlers.remove(&key) {
            self.backend.remove_event_handler(&old);
        }

        let handler_id = HandlerId::new(format!("{prefix}-{}", Uuid::new_v4()));
        match self.backend.add_event_handler(&handler_id, sink) {
            Ok(()) => {
                handlers.insert(key, handler_id.clone());
                handler_id
            }
            Err(err) => {
                warn!(key = ?key, error = %err, "registry: failed to add event handler");
                HandlerId::empty()
            }
        }
    }

    /// Remove the subscription for `key` if present. Unknown keys are a no-op.
    pub fn detach(&self, key: &SubscriptionKey) {
        let removed = self
            .handlers
            .lock()
            .expect("handler map lock poisoned")
            .remove(key);
        if let Some(handler_id) = removed {
            self.backend.remove_event_handler(&handler_id);
        }
    }

    /// Remove every tracked subscription and the refresh signal. Used on
    /// session teardown; never fails.
    pub fn detach_all(&self) {
        let drained: Vec<(SubscriptionKey, HandlerId)> = {
            let mut handlers = self.handlers.lock().expect("handler map lock poisoned");
            handlers.drain().collect()
        };
        for (_, handler_id) in &drained {
            self.backend.remove_event_handler(handler_id);
        }
        self.refresh.lock().expect("refresh slot lock poisoned").take();
        info!(count = drained.len(), "registry: detached all handlers");
    }

    pub fn is_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.handlers
            .lock()
            .expect("handler map lock poisoned")
            .contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.handlers.lock().expect("handler map lock poisoned").len()
    }
}
