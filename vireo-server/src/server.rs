use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use mio::{Events, Interest, Poll, Token};

use vireo_core::ServerState;

use crate::connection::{Connection, Status};
use crate::listener::TCPListener;

const LISTENER: Token = Token(0);
const MIN_TICK: Duration = Duration::from_millis(100);

/// Single-threaded event loop driving every connection of a [`ServerState`].
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TCPListener,
    connections: BTreeMap<Token, Connection>,
    server_state: ServerState,
    next_token: usize,
}

impl Reactor {
    pub fn new(mut listener: TCPListener, server_state: ServerState) -> anyhow::Result<Self> {
        let poll = Poll::new().context("cannot create the poller")?;
        poll.registry()
            .register(listener.source(), LISTENER, Interest::READABLE)
            .context("cannot register the listener")?;

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            connections: BTreeMap::new(),
            server_state,
            next_token: LISTENER.0 + 1,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn server_state(&self) -> &ServerState {
        &self.server_state
    }

    /// Runs until polling fails.
    pub fn run(&mut self) -> anyhow::Result<()> {
        let timeout = self.server_state.timeout_config();
        let tick = timeout
            .activity_timeout
            .min(timeout.ping_timeout)
            .div_f32(4.)
            .max(MIN_TICK);

        loop {
            self.poll_once(Some(tick)).context("polling failed")?;
        }
    }

    /// Waits for readiness (at most `timeout`) and services it: new
    /// connections, incoming lines, timeouts, then pending output.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        let ready = self
            .events
            .iter()
            .map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                (event.token(), readable)
            })
            .collect::<Vec<_>>();

        let now = Instant::now();
        for (token, readable) in ready {
            if token == LISTENER {
                self.accept_connections(now);
                continue;
            }
            if !readable {
                continue;
            }

            let Some(connection) = self.connections.get_mut(&token) else {
                continue;
            };
            if let Status::Closing(reason) = connection.read_ready(&self.server_state, now) {
                self.close(token, &reason);
            }
        }

        self.check_timeouts(now);

        // closing a connection queues QUIT notices for its peers
        while self.flush_connections() {}
        Ok(())
    }

    /// Says goodbye to every client.
    pub fn shutdown(&mut self) {
        let tokens = self.connections.keys().copied().collect::<Vec<_>>();
        for token in tokens {
            self.close(token, b"Server shutting down");
        }
    }

    fn accept_connections(&mut self, now: Instant) {
        loop {
            let (mut stream, peer_addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    return;
                }
            };

            let token = Token(self.next_token);
            self.next_token += 1;
            if let Err(err) = self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                log::warn!("{peer_addr}: cannot register the connection: {err}");
                continue;
            }

            log::info!("new connection from {peer_addr}");
            let connection = Connection::new(token, stream, peer_addr, &self.server_state, now);
            self.connections.insert(token, connection);
        }
    }

    fn check_timeouts(&mut self, now: Instant) {
        let tokens = self.connections.keys().copied().collect::<Vec<_>>();
        for token in tokens {
            let Some(connection) = self.connections.get_mut(&token) else {
                continue;
            };
            if let Status::Closing(reason) = connection.check_timeout(&self.server_state, now) {
                self.close(token, &reason);
            }
        }
    }

    /// Returns true if a connection got closed on the way.
    fn flush_connections(&mut self) -> bool {
        let mut closed = false;
        let tokens = self.connections.keys().copied().collect::<Vec<_>>();
        for token in tokens {
            let Some(connection) = self.connections.get_mut(&token) else {
                continue;
            };
            if let Err(err) = connection.flush(&self.server_state, self.poll.registry()) {
                log::debug!("{}: write failed: {err}", connection.peer_addr());
                self.close(token, b"Write error");
                closed = true;
            }
        }
        closed
    }

    fn close(&mut self, token: Token, reason: &[u8]) {
        let Some(connection) = self.connections.remove(&token) else {
            return;
        };

        let remaining = self.server_state.terminate(connection.id(), reason);
        log::info!(
            "{} disconnected: {}",
            connection.peer_addr(),
            String::from_utf8_lossy(reason)
        );
        connection.close(self.poll.registry(), &remaining);
    }
}
