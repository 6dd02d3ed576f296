#[macro_use]
mod message_writer;
mod client_to_server;
mod config;
mod error;
mod server_state;
mod server_to_client;
mod timeout;
mod types;
mod user_state;
mod validation;

pub use config::{ChannelConfig, ConfigError, Limits, OperatorConfig, ServerConfig, TimeoutConfig};
pub use server_state::ServerState;
pub use types::ConnectionId;
pub use user_state::{
    AuthenticatedState, QuittingState, RegisteredState, UnauthenticatedState, UserState,
};
