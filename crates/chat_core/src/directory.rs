use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use shared::{
    domain::{ChannelKind, ChannelUrl, UserId},
    protocol::{ChannelMember, ChannelSnapshot, CreateChannelParams},
};
use tracing::{info, warn};

use crate::{
    backend::ChatBackend,
    config::ClientConfig,
    error::{is_duplicate_channel_error, is_not_found_error, ChatError, ChatResult},
    session::{Session, SessionManager},
};

/// Local cache entry for one channel. The backend stays authoritative; this
/// is never deleted locally, only refreshed.
#[derive(Debug, Clone)]
pub struct ChannelRef {
    pub channel_url: ChannelUrl,
    pub kind: ChannelKind,
    pub name: String,
    pub members: Vec<ChannelMember>,
    pub created_at: DateTime<Utc>,
    /// Time of the latest message, or channel creation when empty.
    pub last_activity_at: DateTime<Utc>,
    pub unread_message_count: u32,
}

impl ChannelRef {
    pub fn from_snapshot(snapshot: ChannelSnapshot) -> Self {
        let last_activity_at = snapshot
            .last_message
            .as_ref()
            .map(|message| message.created_at)
            .unwrap_or(snapshot.created_at);
        let kind = if snapshot.is_distinct {
            ChannelKind::Pairwise
        } else {
            ChannelKind::Shared
        };
        Self {
            channel_url: snapshot.channel_url,
            kind,
            name: snapshot.name,
            members: snapshot.members,
            created_at: snapshot.created_at,
            last_activity_at,
            unread_message_count: snapshot.unread_message_count,
        }
    }

    pub fn is_member(&self, user_id: &UserId) -> bool {
        self.members.iter().any(|member| member.user_id == *user_id)
    }

    /// Backend name, falling back to the member nicknames when unnamed.
    pub fn display_name(&self) -> String {
        if !self.name.trim().is_empty() {
            return self.name.clone();
        }
        if self.members.is_empty() {
            return self.channel_url.to_string();
        }
        self.members
            .iter()
            .map(|member| member.nickname.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Derivation used by both sides of a 1:1 pair: hash of the two ids sorted
/// lexicographically and joined with an underscore. Either argument order
/// produces the same url.
pub fn pairwise_channel_url(a: &UserId, b: &UserId) -> ChannelUrl {
    let (lo, hi) = if a.as_str() <= b.as_str() {
        (a, b)
    } else {
        (b, a)
    };
    let digest = Sha256::digest(format!("{lo}_{hi}").as_bytes());
    ChannelUrl::new(hex::encode(digest))
}

fn display_or_id(nickname: &str, user_id: &UserId) -> String {
    if nickname.trim().is_empty() {
        user_id.to_string()
    } else {
        nickname.to_owned()
    }
}

fn sort_by_recent_activity(channels: &mut [ChannelRef]) {
    channels.sort_by(|a, b| {
        b.last_activity_at
            .cmp(&a.last_activity_at)
            .then_with(|| a.channel_url.cmp(&b.channel_url))
    });
}

/// Maintains the logical set of channels for the connected user.
pub struct ChannelDirectory {
    backend: Arc<dyn ChatBackend>,
    sessions: Arc<SessionManager>,
    config: ClientConfig,
    cache: Mutex<HashMap<ChannelUrl, ChannelRef>>,
}

impl ChannelDirectory {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        sessions: Arc<SessionManager>,
        config: ClientConfig,
    ) -> Self {
        Self {
            backend,
            sessions,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Channels the user belongs to, most recent activity first, ties broken
    /// by url. An empty backend list bootstraps the shared channel instead.
    pub async fn list_channels(&self) -> ChatResult<Vec<ChannelRef>> {
        self.sessions.session()?;

        let snapshots = self
            .backend
            .my_channels(self.config.channel_list_limit)
            .await?;
        if snapshots.is_empty() {
            info!("directory: no channels yet, bootstrapping shared channel");
            let shared = self.ensure_shared_channel().await?;
            return Ok(vec![shared]);
        }

        let mut channels: Vec<ChannelRef> = snapshots
            .into_iter()
            .map(ChannelRef::from_snapshot)
            .collect();
        sort_by_recent_activity(&mut channels);
        for channel in &channels {
            self.remember(channel);
        }
        Ok(channels)
    }

    /// Look up one channel, refreshing the cache. Misses surface as
    /// `ChannelNotFound`.
    pub async fn get_channel(&self, channel_url: &ChannelUrl) -> ChatResult<ChannelRef> {
        self.sessions.session()?;
        match self.backend.get_channel(channel_url).await {
            Ok(snapshot) => Ok(self.remember_snapshot(snapshot)),
            Err(err) if is_not_found_error(&err) => {
                Err(ChatError::ChannelNotFound(channel_url.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Create a channel, surfacing a lost creation race as `DuplicateChannel`.
    async fn create_channel(&self, params: CreateChannelParams) -> ChatResult<ChannelRef> {
        let url = params.channel_url.clone();
        match self.backend.create_channel(params).await {
            Ok(snapshot) => Ok(self.remember_snapshot(snapshot)),
            Err(err) if is_duplicate_channel_error(&err) => {
                Err(ChatError::DuplicateChannel(url))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Make sure the well-known shared channel exists and the user is in it.
    ///
    /// Lookup first; join when present but not a member; create when absent.
    /// Losing the creation race to another client falls back to join.
    pub async fn ensure_shared_channel(&self) -> ChatResult<ChannelRef> {
        let session = self.sessions.session()?;
        let url = self.config.shared_channel_url.clone();

        match self.get_channel(&url).await {
            Ok(channel) => {
                if channel.is_member(&session.user_id) {
                    return Ok(channel);
                }
                info!(channel_url = %url, "directory: joining shared channel");
                let joined = self.backend.join_channel(&url).await?;
                return Ok(self.remember_snapshot(joined));
            }
            Err(ChatError::ChannelNotFound(_)) => {
                info!(channel_url = %url, "directory: shared channel missing, creating");
            }
            Err(err) => return Err(err),
        }

        let params = CreateChannelParams {
            channel_url: url.clone(),
            name: self.config.shared_channel_name.clone(),
            is_public: true,
            is_distinct: false,
            operator_ids: vec![session.user_id.clone()],
            cover_url: Some(String::new()),
            data: Some(serde_json::json!({ "is_default": true }).to_string()),
        };
        match self.create_channel(params).await {
            Ok(channel) => Ok(channel),
            Err(ChatError::DuplicateChannel(_)) => {
                info!(channel_url = %url, "directory: lost create race, joining instead");
                let joined = self.backend.join_channel(&url).await?;
                Ok(self.remember_snapshot(joined))
            }
            Err(err) => Err(err),
        }
    }

    /// Reconcile 1:1 channels with every given peer.
    ///
    /// Runs an invitation accept pass first, then per peer: skip when already
    /// a member, wait for the peer's invitation when the channel exists
    /// without us, create and invite otherwise. A creation race is yielded to
    /// the winner. Per-peer failures are logged and do not stop the pass.
    pub async fn ensure_pairwise_channels(
        &self,
        peers: &[ChannelMember],
    ) -> ChatResult<Vec<ChannelRef>> {
        let session = self.sessions.session()?;

        if let Err(err) = self.accept_all_pending_invitations().await {
            warn!(error = %err, "directory: invitation pass before pairing failed");
        }

        let mut ensured = Vec::new();
        for peer in peers {
            if peer.user_id == session.user_id {
                continue;
            }
            let url = pairwise_channel_url(&session.user_id, &peer.user_id);

            match self.get_channel(&url).await {
                Ok(channel) => {
                    if channel.is_member(&session.user_id) {
                        ensured.push(channel);
                    } else {
                        info!(
                            peer = %peer.user_id,
                            channel_url = %url,
                            "directory: pairwise channel exists, awaiting invitation"
                        );
                    }
                    continue;
                }
                Err(ChatError::ChannelNotFound(_)) => {}
                Err(err) => {
                    warn!(peer = %peer.user_id, error = %err, "directory: pairwise lookup failed");
                    continue;
                }
            }

            match self.create_pairwise_channel(&session, peer, &url).await {
                Ok(Some(channel)) => ensured.push(channel),
                Ok(None) => {}
                Err(err) => {
                    warn!(peer = %peer.user_id, error = %err, "directory: pairwise create failed");
                }
            }
        }
        Ok(ensured)
    }

    /// Returns `Ok(None)` when the peer won the creation race.
    async fn create_pairwise_channel(
        &self,
        session: &Session,
        peer: &ChannelMember,
        url: &ChannelUrl,
    ) -> ChatResult<Option<ChannelRef>> {
        let params = CreateChannelParams {
            channel_url: url.clone(),
            name: format!(
                "{} & {}",
                display_or_id(&peer.nickname, &peer.user_id),
                display_or_id(&session.display_name, &session.user_id),
            ),
            is_public: false,
            is_distinct: true,
            operator_ids: vec![session.user_id.clone(), peer.user_id.clone()],
            cover_url: None,
            data: None,
        };

        let channel = match self.create_channel(params).await {
            Ok(channel) => channel,
            Err(ChatError::DuplicateChannel(_)) => {
                info!(
                    peer = %peer.user_id,
                    channel_url = %url,
                    "directory: peer created the channel first, awaiting invitation"
                );
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        match self
            .backend
            .invite(url, std::slice::from_ref(&peer.user_id))
            .await
        {
            Ok(()) => {
                info!(
                    peer = %peer.user_id,
                    channel_url = %url,
                    "directory: pairwise channel created, peer invited"
                );
            }
            Err(err) => {
                warn!(
                    peer = %peer.user_id,
                    channel_url = %url,
                    error = %err,
                    "directory: invite failed"
                );
            }
        }
        Ok(Some(channel))
    }

    /// Accept every pending invitation. Per-item failures are logged; returns
    /// how many were accepted.
    pub async fn accept_all_pending_invitations(&self) -> ChatResult<usize> {
        self.sessions.session()?;

        let invited = self.backend.invited_channels().await?;
        let mut accepted = 0usize;
        for snapshot in invited {
            let url = snapshot.channel_url;
            match self.backend.accept_invitation(&url).await {
                Ok(()) => {
                    accepted += 1;
                    info!(channel_url = %url, "directory: invitation accepted");
                }
                Err(err) => {
                    warn!(channel_url = %url, error = %err, "directory: invitation accept failed");
                }
            }
        }
        Ok(accepted)
    }

    /// Everyone in the shared channel except the current user. The roster of
    /// record for pairwise reconciliation.
    pub async fn known_peers(&self) -> ChatResult<Vec<ChannelMember>> {
        let session = self.sessions.session()?;

        match self.get_channel(&self.config.shared_channel_url).await {
            Ok(channel) => Ok(channel
                .members
                .into_iter()
                .filter(|member| member.user_id != session.user_id)
                .collect()),
            Err(ChatError::ChannelNotFound(url)) => {
                warn!(channel_url = %url, "directory: shared channel missing, no peers known");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Last snapshot seen for a url, without a network round trip.
    pub fn cached(&self, channel_url: &ChannelUrl) -> Option<ChannelRef> {
        self.cache
            .lock()
            .expect("channel cache lock poisoned")
            .get(channel_url)
            .cloned()
    }

    pub fn clear(&self) {
        self.cache.lock().expect("channel cache lock poisoned").clear();
    }

    fn remember(&self, channel: &ChannelRef) {
        self.cache
            .lock()
            .expect("channel cache lock poisoned")
            .insert(channel.channel_url.clone(), channel.clone());
    }

    fn remember_snapshot(&self, snapshot: ChannelSnapshot) -> ChannelRef {
        let channel = ChannelRef::from_snapshot(snapshot);
        self.remember(&channel);
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(url: &str, last_activity_secs: i64) -> ChannelRef {
        let at = DateTime::<Utc>::from_timestamp(last_activity_secs, 0).expect("timestamp");
        ChannelRef {
            channel_url: ChannelUrl::new(url),
            kind: ChannelKind::Shared,
            name: String::new(),
            members: Vec::new(),
            created_at: at,
            last_activity_at: at,
            unread_message_count: 0,
        }
    }

    #[test]
    fn pairwise_url_is_order_independent() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        assert_eq!(
            pairwise_channel_url(&alice, &bob),
            pairwise_channel_url(&bob, &alice)
        );
    }

    #[test]
    fn pairwise_url_differs_per_pair() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let carol = UserId::new("carol");
        assert_ne!(
            pairwise_channel_url(&alice, &bob),
            pairwise_channel_url(&alice, &carol)
        );
    }

    #[test]
    fn pairwise_url_is_hex_sha256() {
        let url = pairwise_channel_url(&UserId::new("alice"), &UserId::new("bob"));
        assert_eq!(url.as_str().len(), 64);
        assert!(url.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn recent_activity_sort_breaks_ties_by_url() {
        let mut channels = vec![channel("c", 5), channel("a", 20), channel("b", 5)];
        sort_by_recent_activity(&mut channels);
        let urls: Vec<&str> = channels.iter().map(|c| c.channel_url.as_str()).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
    }

    #[test]
    fn display_name_falls_back_to_member_nicknames() {
        let mut unnamed = channel("u", 0);
        unnamed.members = vec![
            ChannelMember {
                user_id: UserId::new("alice"),
                nickname: "Alice".into(),
            },
            ChannelMember {
                user_id: UserId::new("bob"),
                nickname: "Bob".into(),
            },
        ];
        assert_eq!(unnamed.display_name(), "Alice, Bob");

        let mut named = channel("n", 0);
        named.name = "General Chat".into();
        assert_eq!(named.display_name(), "General Chat");
    }
}
