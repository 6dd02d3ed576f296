mod connection;
mod listener;
mod server;

pub use listener::TCPListener;
pub use server::Reactor;
