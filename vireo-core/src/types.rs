use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use crate::{
    error::ServerStateError,
    message_writer::Mailbox,
    server_to_client::{self, MessageContext},
    timeout::PingState,
};

/// Stable handle of a connection, chosen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub fn new(raw: usize) -> Self {
        ConnectionId(raw)
    }

    pub fn raw(&self) -> usize {
        self.0
    }
}

/// Channel names are compared case-insensitively.
pub(crate) fn channel_key(channel_name: &str) -> String {
    channel_name.to_ascii_uppercase()
}

#[derive(Debug)]
pub(crate) struct User {
    pub(crate) user_id: ConnectionId,
    pub(crate) nickname: Option<String>,
    pub(crate) username: Option<String>,
    pub(crate) realname: Option<Vec<u8>>,
    pub(crate) hostname: String,
    pub(crate) registered: bool,
    pub(crate) server_operator: bool,
    pub(crate) ping: PingState,
    mailbox: Mailbox,
}

impl User {
    pub(crate) fn new(user_id: ConnectionId, hostname: &str, now: Instant) -> Self {
        Self {
            user_id,
            nickname: None,
            username: None,
            realname: None,
            hostname: hostname.to_string(),
            registered: false,
            server_operator: false,
            ping: PingState::new(now),
            mailbox: Mailbox::default(),
        }
    }

    pub(crate) fn send(&self, message: &server_to_client::Message<'_>, context: &MessageContext) {
        self.mailbox.ingest(message, context);
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Nickname to address replies to, `*` until one is chosen.
    pub(crate) fn maybe_nickname(&self) -> &str {
        self.nickname.as_deref().unwrap_or("*")
    }

    pub(crate) fn fullspec(&self) -> String {
        format!(
            "{}!{}@{}",
            self.maybe_nickname(),
            self.username.as_deref().unwrap_or("*"),
            self.hostname
        )
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.nickname.is_some() && self.username.is_some()
    }

    pub(crate) fn has_nickname(&self, nickname: &str) -> bool {
        self.nickname
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case(nickname))
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Topic {
    pub content: Vec<u8>,
    pub ts: u64,
    pub from_nickname: String,
}

impl Topic {
    pub(crate) fn is_valid(&self) -> bool {
        !self.content.is_empty()
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub(crate) struct ChannelUserMode {
    op: bool,
}

impl ChannelUserMode {
    pub(crate) fn with_op(&self) -> Self {
        Self { op: true }
    }

    pub(crate) fn without_op(&self) -> Self {
        Self { op: false }
    }

    pub(crate) fn is_op(&self) -> bool {
        self.op
    }
}

/// Key and limit are only stored while their mode is set.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub(crate) struct ChannelMode {
    invite_only: bool,
    topic_restricted: bool,
    key: Option<String>,
    limit: Option<usize>,
}

impl ChannelMode {
    pub(crate) fn is_invite_only(&self) -> bool {
        self.invite_only
    }

    pub(crate) fn with_invite_only(&self) -> Self {
        Self {
            invite_only: true,
            ..self.clone()
        }
    }

    pub(crate) fn without_invite_only(&self) -> Self {
        Self {
            invite_only: false,
            ..self.clone()
        }
    }

    pub(crate) fn is_topic_restricted(&self) -> bool {
        self.topic_restricted
    }

    pub(crate) fn with_topic_restricted(&self) -> Self {
        Self {
            topic_restricted: true,
            ..self.clone()
        }
    }

    pub(crate) fn without_topic_restricted(&self) -> Self {
        Self {
            topic_restricted: false,
            ..self.clone()
        }
    }

    pub(crate) fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub(crate) fn with_key(&self, key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            ..self.clone()
        }
    }

    pub(crate) fn without_key(&self) -> Self {
        Self {
            key: None,
            ..self.clone()
        }
    }

    pub(crate) fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub(crate) fn with_limit(&self, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..self.clone()
        }
    }

    pub(crate) fn without_limit(&self) -> Self {
        Self {
            limit: None,
            ..self.clone()
        }
    }
}

#[derive(Debug)]
pub(crate) struct Channel {
    /// Name as first declared or joined, shown to clients.
    pub(crate) name: String,
    pub(crate) topic: Topic,
    pub(crate) users: BTreeMap<ConnectionId, ChannelUserMode>,
    pub(crate) invited: HashSet<ConnectionId>,
    pub(crate) mode: ChannelMode,
    /// Persistent channels are kept while empty.
    pub(crate) persistent: bool,
}

impl Channel {
    pub(crate) fn new(name: &str, persistent: bool) -> Self {
        Self {
            name: name.to_string(),
            topic: Topic::default(),
            users: BTreeMap::new(),
            invited: HashSet::new(),
            mode: ChannelMode::default(),
            persistent,
        }
    }

    pub(crate) fn is_member(&self, user_id: ConnectionId) -> bool {
        self.users.contains_key(&user_id)
    }

    /// Channel operators and server operators.
    pub(crate) fn is_privileged(&self, user: &User) -> bool {
        user.server_operator
            || self
                .users
                .get(&user.user_id)
                .is_some_and(ChannelUserMode::is_op)
    }

    /// Drops every trace of the user, membership and pending invite.
    pub(crate) fn forget(&mut self, user_id: ConnectionId) {
        self.users.remove(&user_id);
        self.invited.remove(&user_id);
    }

    pub(crate) fn ensure_user_is_member(&self, user: &User) -> Result<(), ServerStateError> {
        if !self.is_member(user.user_id) {
            return Err(ServerStateError::NotOnChannel {
                client: user.maybe_nickname().to_string(),
                channel: self.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_user_is_privileged(&self, user: &User) -> Result<(), ServerStateError> {
        if !self.is_privileged(user) {
            return Err(ServerStateError::ChanOpPrivsNeeded {
                client: user.maybe_nickname().to_string(),
                channel: self.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_user_can_set_topic(&self, user: &User) -> Result<(), ServerStateError> {
        self.ensure_user_is_member(user)?;
        if self.mode.is_topic_restricted() {
            self.ensure_user_is_privileged(user)?;
        }
        Ok(())
    }

    pub(crate) fn ensure_user_can_send_message(&self, user: &User) -> Result<(), ServerStateError> {
        if !self.is_member(user.user_id) {
            return Err(ServerStateError::CannotSendToChan {
                client: user.maybe_nickname().to_string(),
                channel: self.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_user_can_join(
        &self,
        user: &User,
        key: Option<&str>,
    ) -> Result<(), ServerStateError> {
        let client = || user.maybe_nickname().to_string();

        if self.mode.is_invite_only() && !self.invited.contains(&user.user_id) {
            return Err(ServerStateError::InviteOnlyChan {
                client: client(),
                channel: self.name.clone(),
            });
        }

        if let Some(limit) = self.mode.limit() {
            if self.users.len() >= limit {
                return Err(ServerStateError::ChannelIsFull {
                    client: client(),
                    channel: self.name.clone(),
                });
            }
        }

        if let Some(channel_key) = self.mode.key() {
            if key != Some(channel_key) {
                return Err(ServerStateError::BadChannelKey {
                    client: client(),
                    channel: self.name.clone(),
                });
            }
        }

        Ok(())
    }
}
