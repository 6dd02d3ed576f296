use std::{
    cell::RefCell,
    io::{self, Write},
    marker::PhantomData,
};

use bytes::{Buf, BytesMut};

use crate::server_to_client::{self, MessageContext};

const IRC_MESSAGE_MAX_SIZE: usize = 512;

/// Bytes queued for one connection, waiting for the socket to be writable.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    queue: RefCell<BytesMut>,
}

impl Mailbox {
    pub(crate) fn ingest(&self, message: &server_to_client::Message<'_>, context: &MessageContext) {
        let mut mw = MessageWriter { mailbox: self };
        message.write_to(&mut mw, context);
    }

    fn push(&self, bytes: &[u8]) {
        self.queue.borrow_mut().extend_from_slice(bytes);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Writes as much as the writer accepts.
    /// Returns `Ok(true)` once the queue is empty, `Ok(false)` if the writer would block.
    pub(crate) fn flush_into<W: Write>(&self, writer: &mut W) -> io::Result<bool> {
        let mut queue = self.queue.borrow_mut();
        while !queue.is_empty() {
            match writer.write(&queue[..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => queue.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    pub(crate) fn take(&self) -> Vec<u8> {
        self.queue.take().to_vec()
    }
}

/// A single server_to_client::Message might generate multiple 512-bytes IRC messages.
/// This struct offers a safe interface to write multiple IRC message, while ensuring to respect the
/// size limit of 512 bytes per IRC message.
pub(crate) struct MessageWriter<'m> {
    mailbox: &'m Mailbox,
}

impl<'m> MessageWriter<'m> {
    /// Implementation note: it is not necessary to have a &mut self here,
    /// but it allows to ensure that there are only one OnGoingMessage at a time.
    pub(crate) fn new_message<'w>(&'w mut self) -> OnGoingMessage<'m, 'w> {
        let buf = vec![0_u8; IRC_MESSAGE_MAX_SIZE].into();
        let buf = std::io::Cursor::new(buf);
        OnGoingMessage {
            buf,
            mailbox: self.mailbox,
            phantom: PhantomData,
        }
    }
}

/// Owner MUST call validate() after writing in order to send the message to the mailbox.
#[must_use]
pub(crate) struct OnGoingMessage<'m, 'w> {
    buf: std::io::Cursor<Box<[u8]>>,
    mailbox: &'m Mailbox,
    phantom: PhantomData<&'w mut MessageWriter<'m>>,
}

impl OnGoingMessage<'_, '_> {
    #[inline]
    pub(crate) fn write<T>(mut self, bytes: &T) -> Self
    where
        T: AsRef<[u8]> + ?Sized,
    {
        // CR, LF and NUL would let a client forge lines on other connections
        let chunks = bytes
            .as_ref()
            .split(|&c| matches!(c, b'\r' | b'\n' | b'\0'));
        for chunk in chunks {
            // fails past IRC_MESSAGE_MAX_SIZE bytes, validate() then overwrites the tail
            if self.buf.write_all(chunk).is_err() {
                break;
            }
        }
        self
    }

    pub(crate) fn validate(mut self) {
        // cut at 510 bytes and add new lines
        let pos = self.buf.position().min((IRC_MESSAGE_MAX_SIZE - 2) as u64);
        self.buf.set_position(pos);
        let _ = self.buf.write_all(b"\r\n");

        let len = self.buf.position() as usize;
        let buf = self.buf.into_inner();
        if let Some(bytes) = buf.get(..len) {
            self.mailbox.push(bytes);
        }
    }
}

macro_rules! message {
    ($s:expr, $($args:expr),*) => {{
        let mut m = $s.new_message();
        $(
            m = m.write($args);
        )*
        m.validate();
    }}
}

macro_rules! message_push {
    ($m:ident, $($args:expr),*) => {{
        $(
            $m = $m.write($args);
        )*
    }}
}
