use std::cell::RefCell;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Write};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use subtle::ConstantTimeEq;

use crate::client_to_server::MessageDecodingError;
use crate::config::{ConfigError, Limits, OperatorConfig, ServerConfig, TimeoutConfig};
use crate::error::ServerStateError;
use crate::server_to_client::{self, ChannelInfo, MessageContext, WhoReply};
use crate::timeout::PingStatus;
use crate::types::{channel_key, Channel, ChannelUserMode, ConnectionId, Topic, User};
use crate::user_state::{
    AuthenticatedState, QuittingState, RegisteredState, UnauthenticatedState, UserState,
};
use crate::validation::{
    is_valid_channel_name, is_valid_key, is_valid_nickname, is_valid_realname,
    is_valid_server_name, is_valid_username,
};

/// Registry of every connection and every channel.
///
/// All mutations happen on the reactor thread, the RefCell only lets handlers
/// borrow the registry through a shared reference.
pub struct ServerState(RefCell<ServerStateInner>);

struct ServerStateInner {
    users: HashMap<ConnectionId, User>,
    /// Keyed by the upper-cased channel name.
    channels: BTreeMap<String, Channel>,

    // related to config:
    server_name: String,
    password: Vec<u8>,
    motd: Vec<String>,
    operator: Option<OperatorConfig>,
    timeout_config: TimeoutConfig,
    limits: Limits,
    channel_creation: bool,
    message_context: MessageContext,
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn no_such_channel(user: &User, channel_name: &str) -> ServerStateError {
    ServerStateError::NoSuchChannel {
        client: user.maybe_nickname().to_string(),
        channel: channel_name.to_string(),
    }
}

fn channel_mut<'c>(
    channels: &'c mut BTreeMap<String, Channel>,
    user: &User,
    channel_name: &str,
) -> Result<&'c mut Channel, ServerStateError> {
    channels
        .get_mut(&channel_key(channel_name))
        .ok_or_else(|| no_such_channel(user, channel_name))
}

/// Only registered users can be reached by nickname.
fn find_user<'u>(users: &'u HashMap<ConnectionId, User>, nickname: &str) -> Option<&'u User> {
    users
        .values()
        .find(|u| u.registered && u.has_nickname(nickname))
}

fn broadcast(
    users: &HashMap<ConnectionId, User>,
    channel: &Channel,
    message: &server_to_client::Message<'_>,
    context: &MessageContext,
) {
    channel
        .users
        .keys()
        .flat_map(|user_id| users.get(user_id))
        .for_each(|u| u.send(message, context));
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        let limits = config.limits;
        if !is_valid_server_name(&config.server_name, limits.max_server_name_length) {
            return Err(ConfigError::InvalidServerName(config.server_name));
        }

        let mut channels = BTreeMap::new();
        for channel_config in &config.channels {
            let name = &channel_config.name;
            if !is_valid_channel_name(name, limits.max_channel_name_length) {
                return Err(ConfigError::InvalidChannelName(name.clone()));
            }

            let mut channel = Channel::new(name, true);
            if let Some(key) = &channel_config.key {
                if !is_valid_key(key) {
                    return Err(ConfigError::InvalidChannelKey(name.clone()));
                }
                channel.mode = channel.mode.with_key(key);
            }
            if let Some(topic) = &channel_config.topic {
                channel.topic = Topic {
                    content: topic.as_bytes().to_vec(),
                    ts: unix_timestamp(),
                    from_nickname: config.server_name.clone(),
                };
            }

            match channels.entry(channel_key(name)) {
                Entry::Vacant(entry) => {
                    entry.insert(channel);
                }
                Entry::Occupied(_) => return Err(ConfigError::DuplicateChannel(name.clone())),
            }
        }

        let sv = ServerStateInner {
            users: HashMap::new(),
            channels,

            message_context: MessageContext {
                server_name: config.server_name.clone(),
            },
            server_name: config.server_name,
            password: config.password.into_bytes(),
            motd: config.motd,
            operator: config.operator,
            timeout_config: config.timeout,
            limits,
            channel_creation: config.channel_creation,
        };
        Ok(ServerState(RefCell::new(sv)))
    }

    pub fn server_name(&self) -> String {
        self.0.borrow().server_name.clone()
    }

    pub fn timeout_config(&self) -> TimeoutConfig {
        self.0.borrow().timeout_config.clone()
    }

    /// Longest accepted input line, terminator included.
    pub fn max_message_length(&self) -> usize {
        self.0.borrow().limits.max_message_length
    }

    pub fn connection_count(&self) -> usize {
        self.0.borrow().users.len()
    }
}

/// Functions for the transport
impl ServerState {
    pub fn new_connection(&self, user_id: ConnectionId, hostname: &str, now: Instant) -> UserState {
        let mut sv = self.0.borrow_mut();
        sv.users.insert(user_id, User::new(user_id, hostname, now));
        UserState::Unauthenticated(UnauthenticatedState::new(user_id))
    }

    pub fn record_activity(&self, user_id: ConnectionId, now: Instant) {
        let mut sv = self.0.borrow_mut();
        if let Some(user) = sv.users.get_mut(&user_id) {
            user.ping.on_activity(now);
        }
    }

    pub fn has_outbound(&self, user_id: ConnectionId) -> bool {
        let sv = self.0.borrow();
        sv.users
            .get(&user_id)
            .is_some_and(|user| !user.mailbox().is_empty())
    }

    /// Returns `Ok(true)` once everything queued for the user is written.
    pub fn flush_outbound<W: Write>(
        &self,
        user_id: ConnectionId,
        writer: &mut W,
    ) -> io::Result<bool> {
        let sv = self.0.borrow();
        match sv.users.get(&user_id) {
            Some(user) => user.mailbox().flush_into(writer),
            None => Ok(true),
        }
    }

    /// Removes the user from every channel and from the registry.
    ///
    /// Channel peers receive a QUIT notice, and the bytes still queued for the
    /// user (ending with an ERROR line) are returned for a last write attempt.
    pub fn terminate(&self, user_id: ConnectionId, reason: &[u8]) -> Vec<u8> {
        let mut sv = self.0.borrow_mut();
        sv.terminate(user_id, reason)
    }
}

impl ServerStateInner {
    fn send_error(&self, user_id: ConnectionId, error: ServerStateError) {
        let user = &self.users[&user_id];
        let message = server_to_client::Message::Err(error);
        user.send(&message, &self.message_context);
    }

    fn forget_empty_channels(&mut self) {
        self.channels
            .retain(|_, channel| channel.persistent || !channel.users.is_empty());
    }

    fn terminate(&mut self, user_id: ConnectionId, reason: &[u8]) -> Vec<u8> {
        let Some(user) = self.users.get(&user_id) else {
            return vec![];
        };
        log::info!(
            "{} leaves: {}",
            user.fullspec(),
            String::from_utf8_lossy(reason)
        );

        let mut peers = BTreeSet::new();
        for channel in self.channels.values_mut() {
            if channel.is_member(user_id) {
                peers.extend(channel.users.keys().copied().filter(|&id| id != user_id));
            }
            channel.forget(user_id);
        }

        let message = server_to_client::Message::Quit {
            user_fullspec: &user.fullspec(),
            reason,
        };
        for peer in peers {
            self.users[&peer].send(&message, &self.message_context);
        }

        let mut closing = format!("Closing Link: {} (", self.server_name).into_bytes();
        closing.extend_from_slice(reason);
        closing.push(b')');
        let message = server_to_client::Message::FatalError { reason: &closing };
        user.send(&message, &self.message_context);
        let remaining = user.mailbox().take();

        self.users.remove(&user_id);
        self.forget_empty_channels();
        remaining
    }
}

/// Functions for any connection state
impl ServerState {
    pub(crate) fn user_sends_unknown_command(
        &self,
        user_state: UserState,
        command: &[u8],
    ) -> UserState {
        let sv = self.0.borrow();

        let user_id = user_state.user_id();
        let client = sv.users[&user_id].maybe_nickname().to_string();
        let err = if user_state.is_registered() {
            ServerStateError::UnknownCommand {
                client,
                command: String::from_utf8_lossy(command).into_owned(),
            }
        } else {
            ServerStateError::NotRegistered { client }
        };
        sv.send_error(user_id, err);

        user_state
    }

    pub(crate) fn user_is_not_registered(&self, user_state: UserState) -> UserState {
        let sv = self.0.borrow();

        let user_id = user_state.user_id();
        let client = sv.users[&user_id].maybe_nickname().to_string();
        sv.send_error(user_id, ServerStateError::NotRegistered { client });

        user_state
    }

    pub(crate) fn user_sends_invalid_message(
        &self,
        user_state: UserState,
        error: MessageDecodingError,
    ) -> UserState {
        let sv = self.0.borrow();

        let user_id = user_state.user_id();
        let client = sv.users[&user_id].maybe_nickname().to_string();
        if let Some(err) = ServerStateError::from_decoding_error_with_client(error, client) {
            sv.send_error(user_id, err);
        }

        user_state
    }

    pub(crate) fn user_reregisters(&self, user_state: UserState) -> UserState {
        let sv = self.0.borrow();

        let user_id = user_state.user_id();
        let client = sv.users[&user_id].maybe_nickname().to_string();
        sv.send_error(user_id, ServerStateError::AlreadyRegistered { client });

        user_state
    }

    pub(crate) fn user_pings(&self, user_state: UserState, token: &[u8]) -> UserState {
        let sv = self.0.borrow();

        let user = &sv.users[&user_state.user_id()];
        let message = server_to_client::Message::Pong { token };
        user.send(&message, &sv.message_context);

        user_state
    }

    pub(crate) fn check_user_timeout(&self, user_state: UserState, now: Instant) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id();
        match sv.check_user_timeout(user_id, now) {
            Some(reason) => UserState::Quitting(QuittingState { user_id, reason }),
            None => user_state,
        }
    }
}

impl ServerStateInner {
    /// Returns the quit reason once the user is considered gone.
    fn check_user_timeout(&mut self, user_id: ConnectionId, now: Instant) -> Option<Vec<u8>> {
        let user = self.users.get_mut(&user_id)?;

        match user.ping.check_status(now, &self.timeout_config) {
            PingStatus::AllGood => None,
            PingStatus::NeedToSend => {
                user.ping.on_send_ping(now);
                let token = unix_timestamp().to_string();
                let message = server_to_client::Message::Ping {
                    token: token.as_bytes(),
                };
                user.send(&message, &self.message_context);
                None
            }
            PingStatus::Timeout(idle) => {
                log::debug!("{} does not answer", user.fullspec());
                Some(format!("Ping timeout: {} seconds", idle.as_secs()).into_bytes())
            }
        }
    }
}

/// Functions for users that are not registered yet
impl ServerState {
    pub(crate) fn user_uses_password(
        &self,
        user_state: UnauthenticatedState,
        password: &[u8],
    ) -> UserState {
        let sv = self.0.borrow();

        let user_id = user_state.user_id;
        let matches: bool = sv.password.as_slice().ct_eq(password).into();
        if !matches {
            let client = sv.users[&user_id].maybe_nickname().to_string();
            sv.send_error(user_id, ServerStateError::PasswdMismatch { client });
            return UserState::Unauthenticated(user_state);
        }

        UserState::Authenticated(AuthenticatedState { user_id })
    }

    pub(crate) fn auser_uses_nick(
        &self,
        user_state: AuthenticatedState,
        nickname: &[u8],
    ) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_sets_nick(user_id, nickname) {
            sv.send_error(user_id, err);
            return UserState::Authenticated(user_state);
        }

        sv.check_registration_state(user_state)
    }

    pub(crate) fn auser_uses_username(
        &self,
        user_state: AuthenticatedState,
        username: &[u8],
        realname: &[u8],
    ) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_sets_username(user_id, username, realname) {
            sv.send_error(user_id, err);
            return UserState::Authenticated(user_state);
        }

        sv.check_registration_state(user_state)
    }
}

impl ServerStateInner {
    fn user_sets_username(
        &mut self,
        user_id: ConnectionId,
        username: &[u8],
        realname: &[u8],
    ) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];
        if user.username.is_some() {
            return Err(ServerStateError::AlreadyRegistered {
                client: user.maybe_nickname().to_string(),
            });
        }

        let username = std::str::from_utf8(username)
            .ok()
            .filter(|u| is_valid_username(u.as_bytes()));
        let (Some(username), true) = (username, is_valid_realname(realname)) else {
            log::debug!("{:?} sent an invalid USER, ignored", user_id);
            return Ok(());
        };

        if let Some(user) = self.users.get_mut(&user_id) {
            user.username = Some(username.to_string());
            user.realname = Some(realname.to_vec());
        }
        Ok(())
    }

    fn user_sets_nick(
        &mut self,
        user_id: ConnectionId,
        nickname: &[u8],
    ) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];
        let client = || user.maybe_nickname().to_string();

        let nickname = match std::str::from_utf8(nickname) {
            Ok(nickname) if is_valid_nickname(nickname, self.limits.max_nickname_length) => {
                nickname
            }
            _ => {
                return Err(ServerStateError::ErroneousNickname {
                    client: client(),
                    nickname: String::from_utf8_lossy(nickname).into_owned(),
                });
            }
        };

        if user.nickname.as_deref() == Some(nickname) {
            return Ok(());
        }

        let in_use = self
            .users
            .values()
            .any(|u| u.user_id != user_id && u.has_nickname(nickname));
        if in_use {
            return Err(ServerStateError::NicknameInUse {
                client: client(),
                nickname: nickname.to_string(),
            });
        }

        if user.registered {
            log::info!("{} is now known as {}", user.fullspec(), nickname);

            let message = server_to_client::Message::Nick {
                previous_user_fullspec: &user.fullspec(),
                nickname,
            };
            let mut recipients = BTreeSet::from([user_id]);
            for channel in self.channels.values() {
                if channel.is_member(user_id) {
                    recipients.extend(channel.users.keys().copied());
                }
            }
            for recipient in recipients {
                self.users[&recipient].send(&message, &self.message_context);
            }
        }

        if let Some(user) = self.users.get_mut(&user_id) {
            user.nickname = Some(nickname.to_string());
        }
        Ok(())
    }

    fn check_registration_state(&mut self, user_state: AuthenticatedState) -> UserState {
        let user_id = user_state.user_id;
        let Some(user) = self.users.get_mut(&user_id) else {
            return UserState::Authenticated(user_state);
        };
        if !user.is_ready() {
            return UserState::Authenticated(user_state);
        }
        user.registered = true;

        let user = &self.users[&user_id];
        let nickname = user.maybe_nickname();
        let user_fullspec = user.fullspec();
        log::info!("{} is registered", user_fullspec);

        let message = server_to_client::Message::Welcome {
            nickname,
            user_fullspec: &user_fullspec,
            limits: &self.limits,
        };
        user.send(&message, &self.message_context);

        let message = server_to_client::Message::MOTD {
            client: nickname,
            motd: &self.motd,
        };
        user.send(&message, &self.message_context);

        UserState::Registered(RegisteredState { user_id })
    }
}

impl ServerState {
    pub(crate) fn user_changes_nick(
        &self,
        user_state: RegisteredState,
        nickname: &[u8],
    ) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_sets_nick(user_id, nickname) {
            sv.send_error(user_id, err);
        }

        UserState::Registered(user_state)
    }

    pub(crate) fn user_joins_channels(
        &self,
        user_state: RegisteredState,
        channels: &[&str],
        keys: &[&str],
    ) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id;
        for (i, channel) in channels.iter().enumerate() {
            let key = keys.get(i).copied().filter(|key| !key.is_empty());
            if let Err(err) = sv.user_joins_channel(user_id, channel, key) {
                sv.send_error(user_id, err);
            }
        }

        UserState::Registered(user_state)
    }
}

impl ServerStateInner {
    fn user_joins_channel(
        &mut self,
        user_id: ConnectionId,
        channel_name: &str,
        key: Option<&str>,
    ) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];

        let channel = match self.channels.entry(channel_key(channel_name)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if !self.channel_creation {
                    return Err(no_such_channel(user, channel_name));
                }
                if !is_valid_channel_name(channel_name, self.limits.max_channel_name_length) {
                    return Err(ServerStateError::BadChanMask {
                        client: user.maybe_nickname().to_string(),
                        channel: channel_name.to_string(),
                    });
                }
                log::info!("{} creates {}", user.fullspec(), channel_name);
                entry.insert(Channel::new(channel_name, false))
            }
        };

        if channel.is_member(user_id) {
            return Ok(());
        }
        channel.ensure_user_can_join(user, key)?;

        // the first member of a channel created on the fly runs it
        let user_mode = if channel.users.is_empty() && !channel.persistent {
            ChannelUserMode::default().with_op()
        } else {
            ChannelUserMode::default()
        };
        channel.users.insert(user_id, user_mode);
        channel.invited.remove(&user_id);

        let message = server_to_client::Message::Join {
            channel: &channel.name,
            user_fullspec: &user.fullspec(),
        };
        broadcast(&self.users, channel, &message, &self.message_context);

        if channel.topic.is_valid() {
            let message = server_to_client::Message::RplTopic {
                client: user.maybe_nickname(),
                channel: &channel.name,
                topic: Some(&channel.topic),
            };
            user.send(&message, &self.message_context);
        }

        let nicknames = channel
            .users
            .iter()
            .map(|(member_id, user_mode)| (self.users[member_id].maybe_nickname(), user_mode))
            .collect::<Vec<_>>();
        let message = server_to_client::Message::Names {
            client: user.maybe_nickname(),
            channel: &channel.name,
            nicknames: &nicknames,
        };
        user.send(&message, &self.message_context);

        Ok(())
    }
}

impl ServerState {
    pub(crate) fn user_leaves_channels(
        &self,
        user_state: RegisteredState,
        channels: &[&str],
        reason: Option<&[u8]>,
    ) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id;
        for channel in channels {
            if let Err(err) = sv.user_leaves_channel(user_id, channel, reason) {
                sv.send_error(user_id, err);
            }
        }
        sv.forget_empty_channels();

        UserState::Registered(user_state)
    }
}

impl ServerStateInner {
    fn user_leaves_channel(
        &mut self,
        user_id: ConnectionId,
        channel_name: &str,
        reason: Option<&[u8]>,
    ) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];
        let channel = channel_mut(&mut self.channels, user, channel_name)?;
        channel.ensure_user_is_member(user)?;

        let message = server_to_client::Message::Part {
            user_fullspec: &user.fullspec(),
            channel: &channel.name,
            reason,
        };
        broadcast(&self.users, channel, &message, &self.message_context);

        channel.users.remove(&user_id);
        Ok(())
    }
}

impl ServerState {
    pub(crate) fn user_messages_target(
        &self,
        user_state: RegisteredState,
        target: &str,
        content: &[u8],
    ) -> UserState {
        let sv = self.0.borrow();

        let user_id = user_state.user_id;
        let user = &sv.users[&user_id];
        let message = server_to_client::Message::PrivMsg {
            from_user: &user.fullspec(),
            target,
            content,
        };
        if let Err(err) = sv.deliver(user, target, &message) {
            sv.send_error(user_id, err);
        }

        UserState::Registered(user_state)
    }

    pub(crate) fn user_notices_target(
        &self,
        user_state: RegisteredState,
        target: &str,
        content: &[u8],
    ) -> UserState {
        let sv = self.0.borrow();

        let user = &sv.users[&user_state.user_id];
        let message = server_to_client::Message::Notice {
            from_user: &user.fullspec(),
            target,
            content,
        };
        // NOTICE never generates a reply
        if let Err(err) = sv.deliver(user, target, &message) {
            log::debug!("NOTICE from {} dropped: {}", user.fullspec(), err);
        }

        UserState::Registered(user_state)
    }
}

impl ServerStateInner {
    /// Routes a message to every other member of a channel, or to a single user.
    fn deliver(
        &self,
        user: &User,
        target: &str,
        message: &server_to_client::Message<'_>,
    ) -> Result<(), ServerStateError> {
        if target.starts_with('#') {
            let Some(channel) = self.channels.get(&channel_key(target)) else {
                return Err(no_such_channel(user, target));
            };
            channel.ensure_user_can_send_message(user)?;

            channel
                .users
                .keys()
                .filter(|&&member_id| member_id != user.user_id)
                .flat_map(|member_id| self.users.get(member_id))
                .for_each(|member| member.send(message, &self.message_context));
        } else {
            let Some(target_user) = find_user(&self.users, target) else {
                return Err(ServerStateError::NoSuchNick {
                    client: user.maybe_nickname().to_string(),
                    target: target.to_string(),
                });
            };
            target_user.send(message, &self.message_context);
        }
        Ok(())
    }
}

impl ServerState {
    pub(crate) fn user_asks_who(&self, user_state: RegisteredState, mask: &str) -> UserState {
        let sv = self.0.borrow();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_asks_who(user_id, mask) {
            sv.send_error(user_id, err);
        }

        UserState::Registered(user_state)
    }

    pub(crate) fn user_asks_list(&self, user_state: RegisteredState) -> UserState {
        let sv = self.0.borrow();

        let user = &sv.users[&user_state.user_id];
        let infos = sv
            .channels
            .values()
            .map(|channel| ChannelInfo {
                name: &channel.name,
                count: channel.users.len(),
                topic: &channel.topic.content,
            })
            .collect::<Vec<_>>();
        let message = server_to_client::Message::List {
            client: user.maybe_nickname(),
            infos: &infos,
        };
        user.send(&message, &sv.message_context);

        UserState::Registered(user_state)
    }

    pub(crate) fn user_asks_ison(&self, user_state: RegisteredState, tokens: &[&str]) -> UserState {
        let sv = self.0.borrow();

        let user = &sv.users[&user_state.user_id];
        let client = user.maybe_nickname();
        let mut online = vec![];
        for &token in tokens {
            let found = if token.starts_with('#') {
                sv.channels.contains_key(&channel_key(token))
            } else if let Some(target) = find_user(&sv.users, token) {
                online.push(target.maybe_nickname());
                true
            } else {
                false
            };

            if !found {
                let message = server_to_client::Message::RplNowOff {
                    client,
                    target: token,
                };
                user.send(&message, &sv.message_context);
            }
        }

        let message = server_to_client::Message::RplIson {
            client,
            nicknames: &online,
        };
        user.send(&message, &sv.message_context);

        UserState::Registered(user_state)
    }
}

impl ServerStateInner {
    fn user_asks_who(&self, user_id: ConnectionId, mask: &str) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];
        let Some(channel) = self.channels.get(&channel_key(mask)) else {
            return Err(no_such_channel(user, mask));
        };

        let replies = channel
            .users
            .iter()
            .flat_map(|(member_id, user_mode)| {
                let member = self.users.get(member_id)?;
                Some(WhoReply {
                    channel_user_mode: user_mode,
                    nickname: member.maybe_nickname(),
                    is_op: member.server_operator,
                    hostname: &member.hostname,
                    username: member.username.as_deref().unwrap_or("*"),
                    realname: member.realname.as_deref().unwrap_or_default(),
                })
            })
            .collect::<Vec<_>>();

        let message = server_to_client::Message::Who {
            client: user.maybe_nickname(),
            mask: &channel.name,
            replies: &replies,
        };
        user.send(&message, &self.message_context);
        Ok(())
    }
}

impl ServerState {
    pub(crate) fn user_wants_topic(&self, user_state: RegisteredState, channel: &str) -> UserState {
        let sv = self.0.borrow();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_wants_topic(user_id, channel) {
            sv.send_error(user_id, err);
        }

        UserState::Registered(user_state)
    }

    pub(crate) fn user_sets_topic(
        &self,
        user_state: RegisteredState,
        channel: &str,
        content: &[u8],
    ) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_sets_topic(user_id, channel, content) {
            sv.send_error(user_id, err);
        }

        UserState::Registered(user_state)
    }
}

impl ServerStateInner {
    fn user_wants_topic(
        &self,
        user_id: ConnectionId,
        channel_name: &str,
    ) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];
        let Some(channel) = self.channels.get(&channel_key(channel_name)) else {
            return Err(no_such_channel(user, channel_name));
        };
        channel.ensure_user_is_member(user)?;

        let message = server_to_client::Message::RplTopic {
            client: user.maybe_nickname(),
            channel: &channel.name,
            topic: channel.topic.is_valid().then_some(&channel.topic),
        };
        user.send(&message, &self.message_context);
        Ok(())
    }

    fn user_sets_topic(
        &mut self,
        user_id: ConnectionId,
        channel_name: &str,
        content: &[u8],
    ) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];
        let channel = channel_mut(&mut self.channels, user, channel_name)?;
        channel.ensure_user_can_set_topic(user)?;

        channel.topic = Topic {
            content: content.to_vec(),
            ts: unix_timestamp(),
            from_nickname: user.maybe_nickname().to_string(),
        };

        let message = server_to_client::Message::Topic {
            user_fullspec: &user.fullspec(),
            channel: &channel.name,
            topic: &channel.topic,
        };
        broadcast(&self.users, channel, &message, &self.message_context);
        Ok(())
    }
}

impl ServerState {
    pub(crate) fn user_asks_channel_mode(
        &self,
        user_state: RegisteredState,
        channel: &str,
    ) -> UserState {
        let sv = self.0.borrow();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_asks_channel_mode(user_id, channel) {
            sv.send_error(user_id, err);
        }

        UserState::Registered(user_state)
    }

    pub(crate) fn user_changes_channel_mode(
        &self,
        user_state: RegisteredState,
        channel: &str,
        changes: &str,
        arguments: &[&str],
    ) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_changes_channel_mode(user_id, channel, changes, arguments) {
            sv.send_error(user_id, err);
        }

        UserState::Registered(user_state)
    }
}

impl ServerStateInner {
    fn user_asks_channel_mode(
        &self,
        user_id: ConnectionId,
        channel_name: &str,
    ) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];
        let Some(channel) = self.channels.get(&channel_key(channel_name)) else {
            return Err(no_such_channel(user, channel_name));
        };
        channel.ensure_user_is_member(user)?;

        let message = server_to_client::Message::ChannelMode {
            client: user.maybe_nickname(),
            channel: &channel.name,
            mode: &channel.mode,
        };
        user.send(&message, &self.message_context);
        Ok(())
    }

    /// Applies each flag of the batch in order, with no rollback.
    ///
    /// An unknown letter or a missing argument aborts the rest of the batch. Refused
    /// changes (privileges, key already set, unknown target) are answered one by one.
    fn user_changes_channel_mode(
        &mut self,
        user_id: ConnectionId,
        channel_name: &str,
        changes: &str,
        arguments: &[&str],
    ) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];
        let client = || user.maybe_nickname().to_string();
        let channel = channel_mut(&mut self.channels, user, channel_name)?;
        channel.ensure_user_is_member(user)?;

        if !changes.starts_with(['+', '-']) {
            return Err(ServerStateError::UnknownMode {
                client: client(),
                modechar: changes.to_string(),
            });
        }

        let user_fullspec = user.fullspec();
        let mut arguments = arguments.iter().copied();
        let mut adding = true;
        for letter in changes.chars() {
            match letter {
                '+' => {
                    adding = true;
                    continue;
                }
                '-' => {
                    adding = false;
                    continue;
                }
                'i' | 't' | 'k' | 'l' | 'o' => {}
                _ => {
                    return Err(ServerStateError::UnknownMode {
                        client: client(),
                        modechar: letter.to_string(),
                    });
                }
            }

            let takes_argument = matches!(letter, 'k' | 'o') || (letter == 'l' && adding);
            let argument = if takes_argument {
                let Some(argument) = arguments.next() else {
                    return Err(ServerStateError::NeedMoreParams {
                        client: client(),
                        command: "MODE".to_string(),
                    });
                };
                Some(argument)
            } else {
                None
            };

            let modechar = format!("{}{}", if adding { '+' } else { '-' }, letter);
            let change = match channel.ensure_user_is_privileged(user) {
                Ok(()) => apply_mode_change(&self.users, channel, user, letter, adding, argument),
                Err(err) => Err(err),
            };

            match change {
                Ok(Some(param)) => {
                    let message = server_to_client::Message::Mode {
                        user_fullspec: &user_fullspec,
                        target: &channel.name,
                        modechar: &modechar,
                        param: param.as_deref(),
                    };
                    broadcast(&self.users, channel, &message, &self.message_context);
                }
                Ok(None) => {}
                Err(err) => {
                    let message = server_to_client::Message::Err(err);
                    user.send(&message, &self.message_context);
                }
            }
        }

        Ok(())
    }
}

/// Returns `Ok(None)` when the channel is left unchanged, and the parameter to
/// announce along with the change otherwise.
fn apply_mode_change(
    users: &HashMap<ConnectionId, User>,
    channel: &mut Channel,
    user: &User,
    letter: char,
    adding: bool,
    argument: Option<&str>,
) -> Result<Option<Option<String>>, ServerStateError> {
    let client = || user.maybe_nickname().to_string();
    let previous = channel.mode.clone();

    match (letter, adding, argument) {
        ('i', true, _) => channel.mode = channel.mode.with_invite_only(),
        ('i', false, _) => channel.mode = channel.mode.without_invite_only(),
        ('t', true, _) => channel.mode = channel.mode.with_topic_restricted(),
        ('t', false, _) => channel.mode = channel.mode.without_topic_restricted(),
        ('k', true, Some(key)) => {
            if channel.mode.key().is_some() {
                return Err(ServerStateError::KeySet {
                    client: client(),
                    channel: channel.name.clone(),
                });
            }
            if !is_valid_key(key) {
                return Err(ServerStateError::InvalidKey {
                    client: client(),
                    channel: channel.name.clone(),
                });
            }
            channel.mode = channel.mode.with_key(key);
            return Ok(Some(Some(key.to_string())));
        }
        ('k', false, _) => channel.mode = channel.mode.without_key(),
        ('l', true, Some(limit)) => {
            // a limit that is not a positive number is ignored
            let Some(limit) = limit.parse::<usize>().ok().filter(|&limit| limit > 0) else {
                return Ok(None);
            };
            if channel.mode.limit() == Some(limit) {
                return Ok(None);
            }
            channel.mode = channel.mode.with_limit(limit);
            return Ok(Some(Some(limit.to_string())));
        }
        ('l', false, _) => channel.mode = channel.mode.without_limit(),
        ('o', _, Some(nickname)) => {
            let Some(target) = find_user(users, nickname) else {
                return Err(ServerStateError::NoSuchNick {
                    client: client(),
                    target: nickname.to_string(),
                });
            };
            let Some(target_mode) = channel.users.get_mut(&target.user_id) else {
                return Err(ServerStateError::UserNotInChannel {
                    client: client(),
                    nickname: nickname.to_string(),
                    channel: channel.name.clone(),
                });
            };

            let new_target_mode = if adding {
                target_mode.with_op()
            } else {
                target_mode.without_op()
            };
            if *target_mode == new_target_mode {
                return Ok(None);
            }
            *target_mode = new_target_mode;
            return Ok(Some(Some(target.maybe_nickname().to_string())));
        }
        _ => return Ok(None),
    }

    if channel.mode == previous {
        Ok(None)
    } else {
        Ok(Some(None))
    }
}

impl ServerState {
    pub(crate) fn user_kicks_from_channel(
        &self,
        user_state: RegisteredState,
        channel: &str,
        nickname: &str,
        reason: Option<&[u8]>,
    ) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_kicks_from_channel(user_id, channel, nickname, reason) {
            sv.send_error(user_id, err);
        }
        sv.forget_empty_channels();

        UserState::Registered(user_state)
    }

    pub(crate) fn user_invites_to_channel(
        &self,
        user_state: RegisteredState,
        nickname: &str,
        channel: &str,
    ) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_invites_to_channel(user_id, nickname, channel) {
            sv.send_error(user_id, err);
        }

        UserState::Registered(user_state)
    }
}

impl ServerStateInner {
    fn user_kicks_from_channel(
        &mut self,
        user_id: ConnectionId,
        channel_name: &str,
        nickname: &str,
        reason: Option<&[u8]>,
    ) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];
        let channel = channel_mut(&mut self.channels, user, channel_name)?;
        channel.ensure_user_is_member(user)?;
        channel.ensure_user_is_privileged(user)?;

        let Some(target) = find_user(&self.users, nickname) else {
            return Err(ServerStateError::NoSuchNick {
                client: user.maybe_nickname().to_string(),
                target: nickname.to_string(),
            });
        };
        if !channel.is_member(target.user_id) {
            return Err(ServerStateError::UserNotInChannel {
                client: user.maybe_nickname().to_string(),
                nickname: nickname.to_string(),
                channel: channel.name.clone(),
            });
        }

        let message = server_to_client::Message::Kick {
            user_fullspec: &user.fullspec(),
            channel: &channel.name,
            target_nickname: target.maybe_nickname(),
            reason: reason.unwrap_or(user.maybe_nickname().as_bytes()),
        };
        broadcast(&self.users, channel, &message, &self.message_context);

        log::debug!("{} kicks {} from {}", user.fullspec(), nickname, channel.name);
        channel.users.remove(&target.user_id);
        Ok(())
    }

    fn user_invites_to_channel(
        &mut self,
        user_id: ConnectionId,
        nickname: &str,
        channel_name: &str,
    ) -> Result<(), ServerStateError> {
        let user = &self.users[&user_id];
        let client = || user.maybe_nickname().to_string();
        let channel = channel_mut(&mut self.channels, user, channel_name)?;
        channel.ensure_user_is_member(user)?;

        let Some(target) = find_user(&self.users, nickname) else {
            return Err(ServerStateError::NoSuchNick {
                client: client(),
                target: nickname.to_string(),
            });
        };
        channel.ensure_user_is_privileged(user)?;
        if channel.is_member(target.user_id) {
            return Err(ServerStateError::UserOnChannel {
                client: client(),
                nickname: nickname.to_string(),
                channel: channel.name.clone(),
            });
        }

        channel.invited.insert(target.user_id);

        let message = server_to_client::Message::Invite {
            user_fullspec: &user.fullspec(),
            target_nickname: target.maybe_nickname(),
            channel: &channel.name,
        };
        target.send(&message, &self.message_context);

        let message = server_to_client::Message::RplInviting {
            client: user.maybe_nickname(),
            target_nickname: target.maybe_nickname(),
            channel: &channel.name,
        };
        user.send(&message, &self.message_context);
        Ok(())
    }
}

impl ServerState {
    pub(crate) fn user_becomes_operator(
        &self,
        user_state: RegisteredState,
        username: &[u8],
        password: &[u8],
    ) -> UserState {
        let mut sv = self.0.borrow_mut();

        let user_id = user_state.user_id;
        if let Err(err) = sv.user_becomes_operator(user_id, username, password) {
            sv.send_error(user_id, err);
        }

        UserState::Registered(user_state)
    }
}

impl ServerStateInner {
    fn user_becomes_operator(
        &mut self,
        user_id: ConnectionId,
        username: &[u8],
        password: &[u8],
    ) -> Result<(), ServerStateError> {
        let granted = self.operator.as_ref().is_some_and(|operator| {
            let username = operator.username.as_bytes().ct_eq(username);
            let password = operator.password.as_bytes().ct_eq(password);
            (username & password).into()
        });

        let user = &self.users[&user_id];
        if !granted {
            return Err(ServerStateError::PasswdMismatch {
                client: user.maybe_nickname().to_string(),
            });
        }
        log::info!("{} is now a server operator", user.fullspec());

        if let Some(user) = self.users.get_mut(&user_id) {
            user.server_operator = true;
        }

        let user = &self.users[&user_id];
        let message = server_to_client::Message::RplYoureOper {
            client: user.maybe_nickname(),
        };
        user.send(&message, &self.message_context);

        let message = server_to_client::Message::UserMode {
            nickname: user.maybe_nickname(),
            modechar: "+o",
        };
        self.users
            .values()
            .filter(|u| u.registered)
            .for_each(|u| u.send(&message, &self.message_context));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use vireo_parser::parse_line;

    use super::*;
    use crate::{ChannelConfig, OperatorConfig};

    fn config() -> ServerConfig {
        let mut config = ServerConfig::new("irc.vireo.test", "secret");
        config.motd = vec!["hello".to_string()];
        config.operator = Some(OperatorConfig {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        });
        config.channels = vec![ChannelConfig {
            name: "#room".to_string(),
            key: None,
            topic: Some("welcome".to_string()),
        }];
        config
    }

    fn send(sv: &ServerState, state: UserState, line: &str) -> UserState {
        let message = parse_line(line.as_bytes()).unwrap();
        state.handle_message(sv, message)
    }

    fn drain(sv: &ServerState, raw: usize) -> Vec<String> {
        let mut out = vec![];
        assert!(sv.flush_outbound(ConnectionId::new(raw), &mut out).unwrap());
        String::from_utf8(out)
            .unwrap()
            .split_terminator("\r\n")
            .map(str::to_string)
            .collect()
    }

    fn register(sv: &ServerState, raw: usize, nickname: &str) -> UserState {
        let mut state = sv.new_connection(ConnectionId::new(raw), "127.0.0.1", Instant::now());
        for line in [
            "PASS secret".to_string(),
            format!("NICK {nickname}"),
            format!("USER {nickname} 0 * :{nickname}"),
        ] {
            state = send(sv, state, &line);
        }
        assert!(state.is_registered());
        drain(sv, raw);
        state
    }

    fn oper(sv: &ServerState, raw: usize, state: UserState) -> UserState {
        let state = send(sv, state, "OPER admin hunter2");
        drain(sv, raw);
        state
    }

    fn is_member(sv: &ServerState, channel: &str, raw: usize) -> bool {
        sv.0.borrow().channels[&channel_key(channel)].is_member(ConnectionId::new(raw))
    }

    #[test]
    fn welcome_burst() {
        let sv = ServerState::new(config()).unwrap();
        let mut state = sv.new_connection(ConnectionId::new(1), "127.0.0.1", Instant::now());
        for line in ["PASS secret", "NICK alice", "USER alice 0 * :Alice A"] {
            state = send(&sv, state, line);
        }
        assert!(state.is_registered());

        let lines = drain(&sv, 1);
        assert_eq!(
            lines[0],
            ":irc.vireo.test 001 alice :Welcome to the Internet Relay Network alice!alice@127.0.0.1"
        );
        assert!(lines[1].starts_with(":irc.vireo.test 005 alice "));
        assert!(lines[2].starts_with(":irc.vireo.test 375 alice "));
        assert_eq!(lines[3], ":irc.vireo.test 372 alice :- hello");
        assert_eq!(lines[4], ":irc.vireo.test 376 alice :End of MOTD command");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn empty_motd() {
        let mut config = config();
        config.motd.clear();
        let sv = ServerState::new(config).unwrap();
        let mut state = sv.new_connection(ConnectionId::new(1), "127.0.0.1", Instant::now());
        for line in ["PASS secret", "USER alice 0 * :Alice A", "NICK alice"] {
            state = send(&sv, state, line);
        }
        let lines = drain(&sv, 1);
        assert_eq!(lines[2], ":irc.vireo.test 422 alice :MOTD File is missing");
    }

    #[test]
    fn password_gate() {
        let sv = ServerState::new(config()).unwrap();
        let state = sv.new_connection(ConnectionId::new(1), "127.0.0.1", Instant::now());

        let state = send(&sv, state, "CAP LS 302");
        let state = send(&sv, state, "NICK alice");
        let state = send(&sv, state, "PASS wrong");
        let state = send(&sv, state, "FOO bar");
        assert!(matches!(state, UserState::Unauthenticated(_)));
        assert_eq!(
            drain(&sv, 1),
            [
                ":irc.vireo.test 451 * :You have not registered",
                ":irc.vireo.test 464 * :Password incorrect",
                ":irc.vireo.test 451 * :You have not registered",
            ]
        );

        let state = send(&sv, state, "PASS secret");
        let state = send(&sv, state, "NICK alice");
        let state = send(&sv, state, "JOIN #room");
        let state = send(&sv, state, "PASS secret");
        assert!(matches!(state, UserState::Authenticated(_)));
        assert_eq!(
            drain(&sv, 1),
            [
                ":irc.vireo.test 451 alice :You have not registered",
                ":irc.vireo.test 462 alice :You may not reregister",
            ]
        );
    }

    #[test]
    fn unknown_command_once_registered() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let _alice = send(&sv, alice, "join #room");
        assert_eq!(
            drain(&sv, 1),
            [":irc.vireo.test 421 alice join :Unknown command"]
        );
    }

    #[test]
    fn nickname_collisions() {
        let sv = ServerState::new(config()).unwrap();
        let _alice = register(&sv, 1, "alice");

        let state = sv.new_connection(ConnectionId::new(2), "127.0.0.1", Instant::now());
        let state = send(&sv, state, "PASS secret");
        let state = send(&sv, state, "NICK ALICE");
        let state = send(&sv, state, "NICK 1alice");
        let state = send(&sv, state, "NICK bob");
        let state = send(&sv, state, "USER bob 0 * :Bob");
        assert!(state.is_registered());

        let lines = drain(&sv, 2);
        assert_eq!(lines[0], ":irc.vireo.test 433 * ALICE :Nickname is already in use");
        assert_eq!(lines[1], ":irc.vireo.test 432 * 1alice :Erroneous nickname");
        assert!(lines[2].starts_with(":irc.vireo.test 001 bob "));
    }

    #[test]
    fn nick_change_is_seen_by_channel_peers() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let bob = register(&sv, 2, "bob");
        let _carol = register(&sv, 3, "carol");
        let alice = send(&sv, alice, "JOIN #room");
        let _bob = send(&sv, bob, "JOIN #room");
        drain(&sv, 1);
        drain(&sv, 2);

        let alice = send(&sv, alice, "NICK alicia");
        let expected = [":alice!alice@127.0.0.1 NICK :alicia"];
        assert_eq!(drain(&sv, 1), expected);
        assert_eq!(drain(&sv, 2), expected);
        assert!(drain(&sv, 3).is_empty());

        // same nickname: nothing happens
        let _alice = send(&sv, alice, "NICK alicia");
        assert!(drain(&sv, 1).is_empty());
        assert!(is_member(&sv, "#room", 1));
    }

    #[test]
    fn join_replies() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let bob = register(&sv, 2, "bob");
        let _alice = send(&sv, alice, "JOIN #room");
        drain(&sv, 1);

        let _bob = send(&sv, bob, "JOIN #ROOM,#nowhere");
        let lines = drain(&sv, 2);
        assert_eq!(lines[0], ":bob!bob@127.0.0.1 JOIN #room");
        assert_eq!(lines[1], ":irc.vireo.test 332 bob #room :welcome");
        assert!(lines[2].starts_with(":irc.vireo.test 333 bob #room irc.vireo.test "));
        assert_eq!(lines[3], ":irc.vireo.test 353 bob = #room :alice bob");
        assert_eq!(lines[4], ":irc.vireo.test 366 bob #room :End of NAMES list");
        assert_eq!(lines[5], ":irc.vireo.test 403 bob #nowhere :No such channel");
        assert_eq!(lines.len(), 6);

        assert_eq!(drain(&sv, 1), [":bob!bob@127.0.0.1 JOIN #room"]);
    }

    #[test]
    fn join_with_key() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let alice = oper(&sv, 1, alice);
        let alice = send(&sv, alice, "JOIN #room");
        drain(&sv, 1);
        let _alice = send(&sv, alice, "MODE #room +k correctkey");
        assert_eq!(
            drain(&sv, 1),
            [":alice!alice@127.0.0.1 MODE #room +k correctkey"]
        );

        let bob = register(&sv, 2, "bob");
        let bob = send(&sv, bob, "JOIN #room wrongkey");
        assert_eq!(
            drain(&sv, 2),
            [":irc.vireo.test 475 bob #room :Cannot join channel (+k)"]
        );
        assert!(!is_member(&sv, "#room", 2));

        let _bob = send(&sv, bob, "JOIN #room correctkey");
        assert!(is_member(&sv, "#room", 2));
    }

    #[test]
    fn join_positional_keys() {
        let mut config = config();
        config.channels.push(ChannelConfig {
            name: "#vault".to_string(),
            key: Some("open".to_string()),
            topic: None,
        });
        let sv = ServerState::new(config).unwrap();
        let alice = register(&sv, 1, "alice");

        let _alice = send(&sv, alice, "JOIN #room,#vault ,open");
        assert!(is_member(&sv, "#room", 1));
        assert!(is_member(&sv, "#vault", 1));
    }

    #[test]
    fn channel_limit() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let alice = oper(&sv, 1, alice);
        let alice = send(&sv, alice, "JOIN #room");
        let alice = send(&sv, alice, "MODE #room +l 2");
        drain(&sv, 1);

        // ignored, the limit stays at 2
        let _alice = send(&sv, alice, "MODE #room +l 0");
        assert!(drain(&sv, 1).is_empty());

        let bob = register(&sv, 2, "bob");
        let carol = register(&sv, 3, "carol");
        let bob = send(&sv, bob, "JOIN #room");
        let carol = send(&sv, carol, "JOIN #room");
        assert_eq!(
            drain(&sv, 3),
            [":irc.vireo.test 471 carol #room :Cannot join channel (+l)"]
        );

        let _bob = send(&sv, bob, "PART #room :later");
        let _carol = send(&sv, carol, "JOIN #room");
        assert!(is_member(&sv, "#room", 3));
    }

    #[test]
    fn non_operators_are_refused() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let bob = register(&sv, 2, "bob");
        let _carol = register(&sv, 3, "carol");
        let alice = send(&sv, alice, "JOIN #room");
        let bob = send(&sv, bob, "JOIN #room");
        let alice = oper(&sv, 1, alice);
        let _alice = send(&sv, alice, "MODE #room +t");
        drain(&sv, 1);
        drain(&sv, 2);

        let bob = send(&sv, bob, "MODE #room -t+i");
        let bob = send(&sv, bob, "TOPIC #room :mine");
        let bob = send(&sv, bob, "KICK #room alice");
        let _bob = send(&sv, bob, "INVITE carol #room");
        let refused = ":irc.vireo.test 482 bob #room :You're not channel operator";
        assert_eq!(drain(&sv, 2), [refused; 5]);
        assert!(drain(&sv, 1).is_empty());

        let inner = sv.0.borrow();
        let channel = &inner.channels[&channel_key("#room")];
        assert!(channel.mode.is_topic_restricted());
        assert!(!channel.mode.is_invite_only());
        assert_eq!(channel.topic.content, b"welcome");
        assert!(channel.is_member(ConnectionId::new(1)));
        assert!(channel.invited.is_empty());
    }

    #[test]
    fn mode_batch() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let alice = oper(&sv, 1, alice);
        let alice = send(&sv, alice, "JOIN #room");
        drain(&sv, 1);

        let alice = send(&sv, alice, "MODE #room +itl-i+k 5 pass");
        assert_eq!(
            drain(&sv, 1),
            [
                ":alice!alice@127.0.0.1 MODE #room +i",
                ":alice!alice@127.0.0.1 MODE #room +t",
                ":alice!alice@127.0.0.1 MODE #room +l 5",
                ":alice!alice@127.0.0.1 MODE #room -i",
                ":alice!alice@127.0.0.1 MODE #room +k pass",
            ]
        );

        let alice = send(&sv, alice, "MODE #room");
        let first = drain(&sv, 1);
        let _alice = send(&sv, alice, "MODE #room");
        assert_eq!(first, [":irc.vireo.test 324 alice #room +tkl pass 5"]);
        assert_eq!(drain(&sv, 1), first);
    }

    #[test]
    fn mode_errors() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let alice = oper(&sv, 1, alice);
        let alice = send(&sv, alice, "JOIN #room");
        drain(&sv, 1);

        // earlier flags of the batch stay applied
        let alice = send(&sv, alice, "MODE #room +tz-t");
        assert_eq!(
            drain(&sv, 1),
            [
                ":alice!alice@127.0.0.1 MODE #room +t",
                ":irc.vireo.test 472 alice z :is unknown mode char to me",
            ]
        );

        let alice = send(&sv, alice, "MODE #room i");
        let alice = send(&sv, alice, "MODE #room +k");
        let alice = send(&sv, alice, "MODE #room +k bad,key");
        let alice = send(&sv, alice, "MODE #room +k first");
        let alice = send(&sv, alice, "MODE #room +k second");
        let alice = send(&sv, alice, "MODE #room +o nobody");
        let _alice = send(&sv, alice, "MODE #nowhere +i");
        assert_eq!(
            drain(&sv, 1),
            [
                ":irc.vireo.test 472 alice i :is unknown mode char to me",
                ":irc.vireo.test 461 alice MODE :Not enough parameters",
                ":irc.vireo.test 525 alice #room :Key is not well-formed",
                ":alice!alice@127.0.0.1 MODE #room +k first",
                ":irc.vireo.test 467 alice #room :Channel key already set",
                ":irc.vireo.test 401 alice nobody :No such nick/channel",
                ":irc.vireo.test 403 alice #nowhere :No such channel",
            ]
        );
    }

    #[test]
    fn key_is_cleared() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let alice = oper(&sv, 1, alice);
        let alice = send(&sv, alice, "JOIN #room");
        let alice = send(&sv, alice, "MODE #room +k pass");
        let alice = send(&sv, alice, "MODE #room -k pass");
        drain(&sv, 1);

        let _alice = send(&sv, alice, "MODE #room");
        assert_eq!(drain(&sv, 1), [":irc.vireo.test 324 alice #room +"]);

        let bob = register(&sv, 2, "bob");
        let _bob = send(&sv, bob, "JOIN #room");
        assert!(is_member(&sv, "#room", 2));
    }

    #[test]
    fn kick() {
        let mut config = config();
        config.channel_creation = true;
        let sv = ServerState::new(config).unwrap();
        let alice = register(&sv, 1, "alice");
        let bob = register(&sv, 2, "bob");
        let carol = register(&sv, 3, "carol");
        let alice = send(&sv, alice, "JOIN #den");
        assert_eq!(drain(&sv, 1)[1], ":irc.vireo.test 353 alice = #den :@alice");
        let _bob = send(&sv, bob, "JOIN #den");
        let carol = send(&sv, carol, "JOIN #den");
        drain(&sv, 1);
        drain(&sv, 2);
        drain(&sv, 3);

        let _carol = send(&sv, carol, "KICK #den bob");
        assert_eq!(
            drain(&sv, 3),
            [":irc.vireo.test 482 carol #den :You're not channel operator"]
        );

        let alice = send(&sv, alice, "KICK #den bob :spam");
        let kick = [":alice!alice@127.0.0.1 KICK #den bob :spam"];
        assert_eq!(drain(&sv, 1), kick);
        assert_eq!(drain(&sv, 2), kick);
        assert_eq!(drain(&sv, 3), kick);
        assert!(!is_member(&sv, "#den", 2));

        let _alice = send(&sv, alice, "KICK #den bob");
        assert_eq!(
            drain(&sv, 1),
            [":irc.vireo.test 441 alice bob #den :They aren't on that channel"]
        );
    }

    #[test]
    fn kicking_the_last_member_drops_a_created_channel() {
        let mut config = config();
        config.channel_creation = true;
        let sv = ServerState::new(config).unwrap();
        let alice = register(&sv, 1, "alice");
        let bob = register(&sv, 2, "bob");
        let alice = send(&sv, alice, "JOIN #den");
        let alice = send(&sv, alice, "MODE #den +i");
        drain(&sv, 1);

        let alice = send(&sv, alice, "KICK #den alice");
        assert_eq!(drain(&sv, 1), [":alice!alice@127.0.0.1 KICK #den alice :alice"]);
        assert!(!sv.0.borrow().channels.contains_key(&channel_key("#den")));

        // a fresh channel, without the old +i
        let _bob = send(&sv, bob, "JOIN #den");
        assert!(is_member(&sv, "#den", 2));
        assert_eq!(drain(&sv, 2)[1], ":irc.vireo.test 353 bob = #den :@bob");

        // pre-created channels stay
        let alice = oper(&sv, 1, alice);
        let alice = send(&sv, alice, "JOIN #room");
        let _alice = send(&sv, alice, "KICK #room alice");
        assert!(sv.0.borrow().channels.contains_key(&channel_key("#room")));
    }

    #[test]
    fn embedded_carriage_returns_do_not_split_lines() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let _bob = register(&sv, 2, "bob");

        let _alice = send(&sv, alice, "PRIVMSG bob :hi\rPRIVMSG #x :spoof");
        let mut out = vec![];
        assert!(sv.flush_outbound(ConnectionId::new(2), &mut out).unwrap());
        assert_eq!(out, b":alice!alice@127.0.0.1 PRIVMSG bob :hiPRIVMSG #x :spoof\r\n");
    }

    #[test]
    fn invite_only() {
        let mut config = config();
        config.channel_creation = true;
        let sv = ServerState::new(config).unwrap();
        let alice = register(&sv, 1, "alice");
        let bob = register(&sv, 2, "bob");
        let alice = send(&sv, alice, "JOIN #den");
        let alice = send(&sv, alice, "MODE #den +i");
        drain(&sv, 1);

        let bob = send(&sv, bob, "JOIN #den");
        assert_eq!(
            drain(&sv, 2),
            [":irc.vireo.test 473 bob #den :Cannot join channel (+i)"]
        );

        let alice = send(&sv, alice, "INVITE bob #den");
        assert_eq!(drain(&sv, 1), [":irc.vireo.test 341 alice bob #den"]);
        assert_eq!(drain(&sv, 2), [":alice!alice@127.0.0.1 INVITE bob #den"]);

        let bob = send(&sv, bob, "JOIN #den");
        assert!(is_member(&sv, "#den", 2));
        let _alice = send(&sv, alice, "INVITE bob #den");
        assert_eq!(
            drain(&sv, 1)[1],
            ":irc.vireo.test 443 alice bob #den :is already on channel"
        );

        // the invite is used up by the join
        let bob = send(&sv, bob, "PART #den");
        drain(&sv, 2);
        let _bob = send(&sv, bob, "JOIN #den");
        assert_eq!(
            drain(&sv, 2),
            [":irc.vireo.test 473 bob #den :Cannot join channel (+i)"]
        );
    }

    #[test]
    fn created_channels_disappear_when_empty() {
        let mut config = config();
        config.channel_creation = true;
        let sv = ServerState::new(config).unwrap();
        let alice = register(&sv, 1, "alice");

        let alice = send(&sv, alice, "JOIN den");
        assert_eq!(
            drain(&sv, 1),
            [":irc.vireo.test 476 alice den :Bad Channel Mask"]
        );

        let alice = send(&sv, alice, "JOIN #den,#room");
        drain(&sv, 1);
        let _alice = send(&sv, alice, "PART #den,#room :bye");
        assert_eq!(
            drain(&sv, 1),
            [
                ":alice!alice@127.0.0.1 PART #den :bye",
                ":alice!alice@127.0.0.1 PART #room :bye",
            ]
        );

        let inner = sv.0.borrow();
        assert!(!inner.channels.contains_key(&channel_key("#den")));
        assert!(inner.channels.contains_key(&channel_key("#room")));
    }

    #[test]
    fn part_requires_membership() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let _alice = send(&sv, alice, "PART #room");
        assert_eq!(
            drain(&sv, 1),
            [":irc.vireo.test 442 alice #room :You're not on that channel"]
        );
    }

    #[test]
    fn private_messages() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let bob = register(&sv, 2, "bob");
        let carol = register(&sv, 3, "carol");
        let alice = send(&sv, alice, "JOIN #room");
        let _bob = send(&sv, bob, "JOIN #room");
        drain(&sv, 1);
        drain(&sv, 2);

        let alice = send(&sv, alice, "PRIVMSG #room :hi all");
        assert!(drain(&sv, 1).is_empty());
        assert_eq!(drain(&sv, 2), [":alice!alice@127.0.0.1 PRIVMSG #room :hi all"]);
        assert!(drain(&sv, 3).is_empty());

        let _carol = send(&sv, carol, "PRIVMSG #room :hi");
        assert_eq!(
            drain(&sv, 3),
            [":irc.vireo.test 404 carol #room :Cannot send to channel"]
        );

        let alice = send(&sv, alice, "PRIVMSG Carol :psst");
        assert_eq!(drain(&sv, 3), [":alice!alice@127.0.0.1 PRIVMSG Carol :psst"]);

        let alice = send(&sv, alice, "PRIVMSG dave :hello");
        let alice = send(&sv, alice, "PRIVMSG #nope :hello");
        let alice = send(&sv, alice, "PRIVMSG bob");
        let _alice = send(&sv, alice, "NOTICE dave :hello");
        assert_eq!(
            drain(&sv, 1),
            [
                ":irc.vireo.test 401 alice dave :No such nick/channel",
                ":irc.vireo.test 403 alice #nope :No such channel",
                ":irc.vireo.test 412 alice :No text to send",
            ]
        );
    }

    #[test]
    fn queries() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let alice = oper(&sv, 1, alice);
        let bob = register(&sv, 2, "bob");
        let _alice = send(&sv, alice, "JOIN #room");
        let bob = send(&sv, bob, "JOIN #room");
        drain(&sv, 2);

        let bob = send(&sv, bob, "WHO #room");
        assert_eq!(
            drain(&sv, 2),
            [
                ":irc.vireo.test 352 bob #room alice 127.0.0.1 irc.vireo.test alice H* :0 alice",
                ":irc.vireo.test 352 bob #room bob 127.0.0.1 irc.vireo.test bob H :0 bob",
                ":irc.vireo.test 315 bob #room :End of WHO list",
            ]
        );

        let bob = send(&sv, bob, "LIST");
        assert_eq!(
            drain(&sv, 2),
            [
                ":irc.vireo.test 321 bob Channel :Users  Name",
                ":irc.vireo.test 322 bob #room 2 :welcome",
                ":irc.vireo.test 323 bob :End of LIST",
            ]
        );

        let _bob = send(&sv, bob, "ISON alice dave #room #nope");
        assert_eq!(
            drain(&sv, 2),
            [
                ":irc.vireo.test 605 bob dave * * 0 :is offline",
                ":irc.vireo.test 605 bob #nope * * 0 :is offline",
                ":irc.vireo.test 303 bob :alice",
            ]
        );
    }

    #[test]
    fn topic() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let alice = send(&sv, alice, "TOPIC #room");
        let alice = send(&sv, alice, "JOIN #room");
        drain(&sv, 1);

        let alice = send(&sv, alice, "TOPIC #room :new topic");
        assert_eq!(drain(&sv, 1), [":alice!alice@127.0.0.1 TOPIC #room :new topic"]);

        let _alice = send(&sv, alice, "TOPIC #room");
        let lines = drain(&sv, 1);
        assert_eq!(lines[0], ":irc.vireo.test 332 alice #room :new topic");
        assert!(lines[1].starts_with(":irc.vireo.test 333 alice #room alice "));
    }

    #[test]
    fn oper_command() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let _bob = register(&sv, 2, "bob");

        let alice = send(&sv, alice, "OPER admin nope");
        assert_eq!(drain(&sv, 1), [":irc.vireo.test 464 alice :Password incorrect"]);

        let _alice = send(&sv, alice, "OPER admin hunter2");
        assert_eq!(
            drain(&sv, 1),
            [
                ":irc.vireo.test 381 alice :You are now an IRC operator",
                ":irc.vireo.test MODE alice :+o",
            ]
        );
        assert_eq!(drain(&sv, 2), [":irc.vireo.test MODE alice :+o"]);
    }

    #[test]
    fn ping_and_quit() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");

        let alice = send(&sv, alice, "PING token");
        assert_eq!(
            drain(&sv, 1),
            [":irc.vireo.test PONG irc.vireo.test :token"]
        );

        let alice = send(&sv, alice, "QUIT :gone");
        assert!(!alice.is_alive());
        assert_eq!(alice.quit_reason(), Some(b"gone".as_slice()));

        let bob = register(&sv, 2, "bob");
        let bob = send(&sv, bob, "QUIT");
        assert_eq!(bob.quit_reason(), Some(b"Client Quit".as_slice()));
    }

    #[test]
    fn idle_timeout() {
        let sv = ServerState::new(config()).unwrap();
        let t0 = Instant::now();
        let state = sv.new_connection(ConnectionId::new(1), "127.0.0.1", t0);

        let state = state.check_timeout(&sv, t0 + Duration::from_secs(60));
        assert!(drain(&sv, 1).is_empty());

        let state = state.check_timeout(&sv, t0 + Duration::from_secs(121));
        let lines = drain(&sv, 1);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(":irc.vireo.test PING :"));

        let state = state.check_timeout(&sv, t0 + Duration::from_secs(140));
        assert!(drain(&sv, 1).is_empty());
        assert!(state.is_alive());

        let state = state.check_timeout(&sv, t0 + Duration::from_secs(152));
        assert_eq!(
            state.quit_reason(),
            Some(b"Ping timeout: 152 seconds".as_slice())
        );
    }

    #[test]
    fn activity_answers_ping() {
        let sv = ServerState::new(config()).unwrap();
        let t0 = Instant::now();
        let id = ConnectionId::new(1);
        let state = sv.new_connection(id, "127.0.0.1", t0);

        let state = state.check_timeout(&sv, t0 + Duration::from_secs(121));
        sv.record_activity(id, t0 + Duration::from_secs(130));
        let state = state.check_timeout(&sv, t0 + Duration::from_secs(152));
        assert!(state.is_alive());
    }

    #[test]
    fn terminate() {
        let sv = ServerState::new(config()).unwrap();
        let alice = register(&sv, 1, "alice");
        let bob = register(&sv, 2, "bob");
        let _carol = register(&sv, 3, "carol");
        let _alice = send(&sv, alice, "JOIN #room");
        let _bob = send(&sv, bob, "JOIN #room");
        drain(&sv, 1);
        drain(&sv, 2);

        let remaining = sv.terminate(ConnectionId::new(1), b"Client Quit");
        assert_eq!(
            remaining,
            b":irc.vireo.test ERROR :Closing Link: irc.vireo.test (Client Quit)\r\n"
        );
        assert_eq!(drain(&sv, 2), [":alice!alice@127.0.0.1 QUIT :Client Quit"]);
        assert!(drain(&sv, 3).is_empty());
        assert!(!is_member(&sv, "#room", 1));
        assert_eq!(sv.connection_count(), 2);

        // the nickname is free again
        let _alice = register(&sv, 4, "alice");
    }

    #[test]
    fn invalid_configurations() {
        let config = ServerConfig::new("bad_name", "secret");
        assert!(matches!(
            ServerState::new(config),
            Err(ConfigError::InvalidServerName(_))
        ));

        let mut config = ServerConfig::new("irc.vireo.test", "secret");
        config.channels = ["#a", "#A"]
            .into_iter()
            .map(|name| ChannelConfig {
                name: name.to_string(),
                key: None,
                topic: None,
            })
            .collect();
        assert!(matches!(
            ServerState::new(config),
            Err(ConfigError::DuplicateChannel(_))
        ));

        let mut config = ServerConfig::new("irc.vireo.test", "secret");
        config.channels = vec![ChannelConfig {
            name: "#a".to_string(),
            key: Some("has space".to_string()),
            topic: None,
        }];
        assert!(matches!(
            ServerState::new(config),
            Err(ConfigError::InvalidChannelKey(_))
        ));
    }
}
