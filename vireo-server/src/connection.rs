use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use vireo_core::{ConnectionId, ServerState, UserState};
use vireo_parser::{LineFramer, ParsingError};

const READ_CHUNK: usize = 4096;

pub(crate) enum Status {
    Open,
    Closing(Vec<u8>),
}

/// One accepted client: its socket, its input buffer and its protocol state.
pub(crate) struct Connection {
    id: ConnectionId,
    token: Token,
    stream: TcpStream,
    peer_addr: SocketAddr,
    framer: LineFramer,
    state: Option<UserState>,
    /// WRITABLE interest is only registered while output is pending.
    writable: bool,
}

impl Connection {
    pub(crate) fn new(
        token: Token,
        stream: TcpStream,
        peer_addr: SocketAddr,
        server_state: &ServerState,
        now: Instant,
    ) -> Self {
        let id = ConnectionId::new(token.0);
        let state = server_state.new_connection(id, &peer_addr.ip().to_string(), now);
        Self {
            id,
            token,
            stream,
            peer_addr,
            framer: LineFramer::new(server_state.max_message_length()),
            state: Some(state),
            writable: false,
        }
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn update_state(&mut self, f: impl FnOnce(UserState) -> UserState) -> Status {
        let Some(state) = self.state.take() else {
            return Status::Closing(b"Connection closed".to_vec());
        };

        let state = f(state);
        let status = match state.quit_reason() {
            Some(reason) => Status::Closing(reason.to_vec()),
            None => Status::Open,
        };
        self.state = Some(state);
        status
    }

    /// Drains the socket and runs every complete line through the state machine.
    pub(crate) fn read_ready(&mut self, server_state: &ServerState, now: Instant) -> Status {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Status::Closing(b"Connection closed".to_vec()),
                Ok(received) => {
                    server_state.record_activity(self.id, now);
                    self.framer.feed(&buf[..received]);
                    if let Status::Closing(reason) = self.process_lines(server_state) {
                        return Status::Closing(reason);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Status::Open,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("{}: read failed: {err}", self.peer_addr);
                    return Status::Closing(b"Connection closed".to_vec());
                }
            }
        }
    }

    fn process_lines(&mut self, server_state: &ServerState) -> Status {
        loop {
            let line = match self.framer.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return Status::Open,
                Err(err @ ParsingError::LineTooLong { .. }) => {
                    log::warn!("{}: {err}", self.peer_addr);
                    return Status::Closing(b"Max line length exceeded".to_vec());
                }
                Err(err) => {
                    log::warn!("{}: {err}", self.peer_addr);
                    continue;
                }
            };

            let message = match vireo_parser::parse_line(&line) {
                Ok(message) => message,
                Err(err) => {
                    log::warn!("error when parsing message: {err:#}");
                    continue;
                }
            };

            if let Status::Closing(reason) =
                self.update_state(|state| state.handle_message(server_state, message))
            {
                return Status::Closing(reason);
            }
        }
    }

    pub(crate) fn check_timeout(&mut self, server_state: &ServerState, now: Instant) -> Status {
        self.update_state(|state| state.check_timeout(server_state, now))
    }

    /// Writes as much queued output as the socket takes, and keeps the
    /// WRITABLE interest in sync with what is left.
    pub(crate) fn flush(
        &mut self,
        server_state: &ServerState,
        registry: &Registry,
    ) -> io::Result<()> {
        if !self.writable && !server_state.has_outbound(self.id) {
            return Ok(());
        }

        let done = server_state.flush_outbound(self.id, &mut self.stream)?;
        if done == self.writable {
            let interest = if done {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            registry.reregister(&mut self.stream, self.token, interest)?;
            self.writable = !done;
        }
        Ok(())
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    /// Last write attempt, then the socket is released.
    pub(crate) fn close(mut self, registry: &Registry, remaining: &[u8]) {
        if !remaining.is_empty() {
            if let Err(err) = self.stream.write(remaining) {
                log::debug!("{}: could not send the last bytes: {err}", self.peer_addr);
            }
        }
        if let Err(err) = self.stream.shutdown(Shutdown::Write) {
            log::debug!("{}: shutdown failed: {err}", self.peer_addr);
        }
        if let Err(err) = registry.deregister(&mut self.stream) {
            log::debug!("{}: deregister failed: {err}", self.peer_addr);
        }
    }
}
