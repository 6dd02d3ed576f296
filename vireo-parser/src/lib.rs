/// Note: Source prefixes (server-to-server traffic) are not handled.
use smallvec::SmallVec;

mod framer;
mod parser;

pub use crate::framer::{LineFramer, ParsingError};
pub use crate::parser::parse_line;

pub type Command = [u8];
pub type Parameters<'a> = SmallVec<[&'a [u8]; 15]>;

///
/// See: https://modern.ircdocs.horse/#client-to-server-protocol-structure
///
#[derive(Debug)]
pub struct Message<'m> {
    command: &'m Command,
    parameters: Parameters<'m>,
}

impl<'m> Message<'m> {
    pub fn command(&self) -> &'m Command {
        self.command
    }

    pub fn parameters(&self) -> &Parameters<'m> {
        &self.parameters
    }

    pub fn first_parameter(&self) -> Option<&'m [u8]> {
        self.parameters.first().copied()
    }

    pub fn parameter(&self, index: usize) -> Option<&'m [u8]> {
        self.parameters.get(index).copied()
    }
}
