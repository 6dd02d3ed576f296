use bytes::BytesMut;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParsingError {
    #[error("line longer than {max} bytes")]
    LineTooLong { max: usize },
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Accumulates the bytes received on a connection and cuts them into lines.
///
/// A line ends with `\n`, optionally preceded by `\r`. A lone `\r` does not end a line.
/// Neither a complete line (terminator included) nor a pending partial line may exceed
/// `max_line_length` bytes.
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    max_line_length: usize,
}

impl LineFramer {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_line_length.min(4096)),
            max_line_length,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete line without its terminator, or `None` if more bytes
    /// are needed. Empty lines are skipped.
    pub fn next_line(&mut self) -> Result<Option<BytesMut>, ParsingError> {
        loop {
            let Some(end) = self.buffer.iter().position(|&c| c == b'\n') else {
                if self.buffer.len() > self.max_line_length {
                    return Err(ParsingError::LineTooLong {
                        max: self.max_line_length,
                    });
                }
                return Ok(None);
            };

            if end + 1 > self.max_line_length {
                return Err(ParsingError::LineTooLong {
                    max: self.max_line_length,
                });
            }

            let mut line = self.buffer.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }

            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }
}
