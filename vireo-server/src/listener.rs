use std::io;
use std::net::SocketAddr;

use anyhow::Context;
use mio::net::{TcpListener, TcpStream};

/// Bind a TCP socket from the std:: (blocking), then hand it over to mio.
fn bind_tcp_socket(addr: &str) -> io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener))
}

pub struct TCPListener {
    listener: TcpListener,
}

impl TCPListener {
    pub fn try_new(address: &str, port: u16) -> anyhow::Result<Self> {
        let addr = format!("{address}:{port}");
        let listener = bind_tcp_socket(&addr).with_context(|| format!("cannot listen on {addr}"))?;

        log::info!("listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepted streams are already non-blocking.
    pub(crate) fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer_addr) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        Ok((stream, peer_addr))
    }

    pub(crate) fn source(&mut self) -> &mut TcpListener {
        &mut self.listener
    }
}
