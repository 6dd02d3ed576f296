use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_while, take_while1, take_while_m_n},
    character::{
        complete::{char, space0},
        is_alphabetic, is_digit,
    },
    combinator::{all_consuming, eof, peek, rest},
    multi::many0,
    sequence::preceded,
    IResult,
};

use crate::{Command, Message, ParsingError, Parameters};

// command ::= letter* / 3digit, followed by a space or the end of the line
fn parse_command(buf: &[u8]) -> IResult<&[u8], &Command> {
    let letters = take_while1(is_alphabetic);
    let digits = take_while_m_n(3, 3, is_digit);

    let (buf, command) = alt((letters, digits))(buf)?;
    let (buf, _) = peek(alt((eof, tag::<_, _, nom::error::Error<&[u8]>>(" "))))(buf)?;
    Ok((buf, command))
}

fn parse_parameters(mut buf: &[u8]) -> IResult<&[u8], Parameters<'_>> {
    let is_space = |c: u8| -> bool { c == b' ' };

    let mut params: Parameters<'_> = smallvec::smallvec!();
    loop {
        let (buf_, _spaces) = take_while(is_space)(buf)?;
        buf = buf_;

        // trailing spaces do not make an empty parameter
        if buf.is_empty() {
            break;
        }

        buf = if peek(tag::<_, _, nom::error::Error<&[u8]>>(b":"))(buf).is_ok() {
            let (buf_, rest) = preceded(tag(b":"), rest)(buf)?;
            params.push(rest);
            buf_
        } else {
            let (buf_, param) = take_till(is_space)(buf)?;
            params.push(param);
            buf_
        }
    }

    Ok((buf, params))
}

// message ::= <command> <parameters>
fn parse_message(buf: &[u8]) -> IResult<&[u8], Message<'_>> {
    let space = &char(' ');
    let (buf, _) = space0(buf)?;
    let (buf, command) = parse_command(buf)?;
    let (buf, parameters) = preceded(many0(space), parse_parameters)(buf)?;
    Ok((
        buf,
        Message {
            command,
            parameters,
        },
    ))
}

/// Parses one line, already stripped of its terminator.
pub fn parse_line(line: &[u8]) -> Result<Message<'_>, ParsingError> {
    all_consuming(parse_message)(line)
        .map(|(_, message)| message)
        .map_err(|err| ParsingError::Malformed(err.to_string()))
}
