use std::sync::{Arc, Mutex};

use shared::domain::UserId;
use tracing::{info, warn};

use crate::{
    backend::ChatBackend,
    error::{ChatError, ChatResult},
    registry::SubscriptionRegistry,
};

/// Live authenticated session. At most one exists per manager.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub display_name: String,
    pub connection_handle: String,
}

enum SessionState {
    Disconnected,
    Connecting,
    Connected(Session),
}

/// Owns the single authenticated connection for the process lifetime.
pub struct SessionManager {
    backend: Arc<dyn ChatBackend>,
    registry: Arc<SubscriptionRegistry>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn ChatBackend>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            backend,
            registry,
            state: Mutex::new(SessionState::Disconnected),
        }
    }

    /// Connect and push the display name to the backend profile.
    ///
    /// Returns the existing session if one is already live. Errors with
    /// `AlreadyConnecting` while another start is in flight. A failed start
    /// resets to disconnected so the caller can retry.
    pub async fn start(&self, user_id: UserId, display_name: &str) -> ChatResult<Session> {
        {
            let mut state = self.state.lock().expect("session state lock poisoned");
            match &*state {
                SessionState::Connecting => return Err(ChatError::AlreadyConnecting),
                SessionState::Connected(session) => {
                    info!(user_id = %session.user_id, "session: already connected, reusing");
                    return Ok(session.clone());
                }
                SessionState::Disconnected => *state = SessionState::Connecting,
            }
        }

        match self.connect_and_apply_profile(&user_id, display_name).await {
            Ok(session) => {
                let mut state = self.state.lock().expect("session state lock poisoned");
                *state = SessionState::Connected(session.clone());
                info!(user_id = %session.user_id, "session: connected");
                Ok(session)
            }
            Err(err) => {
                if let Err(cleanup) = self.backend.disconnect().await {
                    warn!(error = %cleanup, "session: cleanup disconnect failed");
                }
                let mut state = self.state.lock().expect("session state lock poisoned");
                *state = SessionState::Disconnected;
                Err(err)
            }
        }
    }

    async fn connect_and_apply_profile(
        &self,
        user_id: &UserId,
        display_name: &str,
    ) -> ChatResult<Session> {
        let connected = self.backend.connect(user_id).await?;
        self.backend.update_profile(display_name).await?;
        Ok(Session {
            user_id: connected.user_id,
            display_name: display_name.to_owned(),
            connection_handle: connected.connection_handle,
        })
    }

    /// Detach every subscription, then close the connection.
    ///
    /// No-op when no session is live; calling it twice is fine. A connect in
    /// flight is left alone (there is no session to stop yet).
    pub async fn stop(&self) -> ChatResult<()> {
        let previous = {
            let mut state = self.state.lock().expect("session state lock poisoned");
            match std::mem::replace(&mut *state, SessionState::Disconnected) {
                SessionState::Connected(session) => Some(session),
                other => {
                    *state = other;
                    None
                }
            }
        };

        let Some(session) = previous else {
            return Ok(());
        };

        self.registry.detach_all();
        if let Err(err) = self.backend.disconnect().await {
            warn!(error = %err, "session: disconnect failed");
        }
        info!(user_id = %session.user_id, "session: stopped");
        Ok(())
    }

    /// Current session, or `NotConnected`.
    pub fn session(&self) -> ChatResult<Session> {
        let state = self.state.lock().expect("session state lock poisoned");
        match &*state {
            SessionState::Connected(session) => Ok(session.clone()),
            _ => Err(ChatError::NotConnected),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_ok()
    }
}
