use std::time::Instant;

use crate::client_to_server::{self, Access};
use crate::server_state::ServerState;
use crate::types::ConnectionId;

/// Connected, the password is not checked yet.
#[derive(Debug)]
pub struct UnauthenticatedState {
    pub(crate) user_id: ConnectionId,
}

impl UnauthenticatedState {
    pub(crate) fn new(user_id: ConnectionId) -> Self {
        Self { user_id }
    }

    fn handle_message(
        self,
        server_state: &ServerState,
        message: client_to_server::Message<'_>,
    ) -> UserState {
        match message {
            client_to_server::Message::Pass(password) => {
                server_state.user_uses_password(self, password)
            }
            // CAP, PROTOCTL and PONG are accepted and ignored
            _ => UserState::Unauthenticated(self),
        }
    }
}

/// The password matched, NICK and USER are in progress.
#[derive(Debug)]
pub struct AuthenticatedState {
    pub(crate) user_id: ConnectionId,
}

impl AuthenticatedState {
    fn handle_message(
        self,
        server_state: &ServerState,
        message: client_to_server::Message<'_>,
    ) -> UserState {
        match message {
            client_to_server::Message::Pass(_) => {
                server_state.user_reregisters(UserState::Authenticated(self))
            }
            client_to_server::Message::Nick(nickname) => {
                server_state.auser_uses_nick(self, nickname)
            }
            client_to_server::Message::User(username, realname) => {
                server_state.auser_uses_username(self, username, realname)
            }
            client_to_server::Message::Ping(token) => {
                server_state.user_pings(UserState::Authenticated(self), token)
            }
            client_to_server::Message::Quit(reason) => {
                UserState::Quitting(QuittingState::new(self.user_id, reason))
            }
            _ => UserState::Authenticated(self),
        }
    }
}

#[derive(Debug)]
pub struct RegisteredState {
    pub(crate) user_id: ConnectionId,
}

impl RegisteredState {
    fn handle_message(
        self,
        server_state: &ServerState,
        message: client_to_server::Message<'_>,
    ) -> UserState {
        match message {
            client_to_server::Message::Nick(nickname) => {
                server_state.user_changes_nick(self, nickname)
            }
            client_to_server::Message::Join(channels, keys) => {
                server_state.user_joins_channels(self, &channels, &keys)
            }
            client_to_server::Message::Part(channels, reason) => {
                server_state.user_leaves_channels(self, &channels, reason)
            }
            client_to_server::Message::PrivMsg(target, content) => {
                server_state.user_messages_target(self, target, content)
            }
            client_to_server::Message::Notice(target, content) => {
                server_state.user_notices_target(self, target, content)
            }
            client_to_server::Message::Who(mask) => server_state.user_asks_who(self, mask),
            client_to_server::Message::List => server_state.user_asks_list(self),
            client_to_server::Message::Ison(tokens) => server_state.user_asks_ison(self, &tokens),
            client_to_server::Message::GetTopic(channel) => {
                server_state.user_wants_topic(self, channel)
            }
            client_to_server::Message::SetTopic(channel, content) => {
                server_state.user_sets_topic(self, channel, content)
            }
            client_to_server::Message::AskModeChannel(channel) => {
                server_state.user_asks_channel_mode(self, channel)
            }
            client_to_server::Message::ChangeModeChannel(channel, changes, arguments) => {
                server_state.user_changes_channel_mode(self, channel, changes, &arguments)
            }
            client_to_server::Message::Kick(channel, nickname, reason) => {
                server_state.user_kicks_from_channel(self, channel, nickname, reason)
            }
            client_to_server::Message::Invite(nickname, channel) => {
                server_state.user_invites_to_channel(self, nickname, channel)
            }
            client_to_server::Message::Oper(username, password) => {
                server_state.user_becomes_operator(self, username, password)
            }
            client_to_server::Message::Ping(token) => {
                server_state.user_pings(UserState::Registered(self), token)
            }
            client_to_server::Message::Quit(reason) => {
                UserState::Quitting(QuittingState::new(self.user_id, reason))
            }
            client_to_server::Message::Pass(_) | client_to_server::Message::User(_, _) => {
                server_state.user_reregisters(UserState::Registered(self))
            }
            client_to_server::Message::Cap
            | client_to_server::Message::Protoctl
            | client_to_server::Message::Pong => UserState::Registered(self),
        }
    }
}

/// The connection must be torn down by the transport, with this reason.
#[derive(Debug)]
pub struct QuittingState {
    pub(crate) user_id: ConnectionId,
    pub(crate) reason: Vec<u8>,
}

impl QuittingState {
    pub(crate) fn new(user_id: ConnectionId, reason: Option<&[u8]>) -> Self {
        Self {
            user_id,
            reason: reason.unwrap_or(b"Client Quit").to_vec(),
        }
    }
}

#[derive(Debug)]
pub enum UserState {
    Unauthenticated(UnauthenticatedState),
    Authenticated(AuthenticatedState),
    Registered(RegisteredState),
    Quitting(QuittingState),
}

impl UserState {
    pub fn is_alive(&self) -> bool {
        !matches!(self, UserState::Quitting(_))
    }

    pub fn quit_reason(&self) -> Option<&[u8]> {
        match self {
            UserState::Quitting(state) => Some(&state.reason),
            _ => None,
        }
    }

    pub(crate) fn user_id(&self) -> ConnectionId {
        match self {
            UserState::Unauthenticated(state) => state.user_id,
            UserState::Authenticated(state) => state.user_id,
            UserState::Registered(state) => state.user_id,
            UserState::Quitting(state) => state.user_id,
        }
    }

    pub(crate) fn is_registered(&self) -> bool {
        matches!(self, UserState::Registered(_))
    }

    fn access(&self) -> Access {
        match self {
            UserState::Unauthenticated(_) | UserState::Quitting(_) => Access::Open,
            UserState::Authenticated(_) => Access::Authenticated,
            UserState::Registered(_) => Access::Registered,
        }
    }

    /// Sends a PING or gives up on the connection when it stays silent for too long.
    pub fn check_timeout(self, server_state: &ServerState, now: Instant) -> UserState {
        match self {
            UserState::Quitting(_) => self,
            _ => server_state.check_user_timeout(self, now),
        }
    }

    pub fn handle_message(
        self,
        server_state: &ServerState,
        message: vireo_parser::Message<'_>,
    ) -> UserState {
        if !self.is_alive() {
            return self;
        }

        let Some(command) = client_to_server::lookup(message.command()) else {
            return server_state.user_sends_unknown_command(self, message.command());
        };

        if command.access > self.access() {
            return server_state.user_is_not_registered(self);
        }

        let message = match command.decode(&message) {
            Ok(message) => message,
            Err(error) => return server_state.user_sends_invalid_message(self, error),
        };

        match self {
            UserState::Unauthenticated(state) => state.handle_message(server_state, message),
            UserState::Authenticated(state) => state.handle_message(server_state, message),
            UserState::Registered(state) => state.handle_message(server_state, message),
            UserState::Quitting(_) => self,
        }
    }
}
