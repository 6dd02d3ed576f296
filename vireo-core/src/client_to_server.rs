/// Which connection state a command needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Access {
    /// Accepted before the password check.
    Open,
    Authenticated,
    Registered,
}

#[derive(Debug)]
pub(crate) enum Message<'m> {
    Pass(&'m [u8]),
    Cap,
    Protoctl,
    Pong,
    Nick(&'m [u8]),
    User(&'m [u8], &'m [u8]),
    Ping(&'m [u8]),
    Quit(Option<&'m [u8]>),
    Join(Vec<&'m str>, Vec<&'m str>),
    Part(Vec<&'m str>, Option<&'m [u8]>),
    PrivMsg(&'m str, &'m [u8]),
    Notice(&'m str, &'m [u8]),
    Who(&'m str),
    List,
    Ison(Vec<&'m str>),
    GetTopic(&'m str),
    SetTopic(&'m str, &'m [u8]),
    AskModeChannel(&'m str),
    ChangeModeChannel(&'m str, &'m str, Vec<&'m str>),
    Kick(&'m str, &'m str, Option<&'m [u8]>),
    Invite(&'m str, &'m str),
    Oper(&'m [u8], &'m [u8]),
}

#[derive(Debug)]
pub(crate) enum MessageDecodingError {
    CannotDecodeUtf8 { command: &'static str },
    NotEnoughParameters { command: &'static str },
    NoTextToSend {},
    SilentError {},
}

fn str2<'a>(command: &'static str, s: &'a [u8]) -> Result<&'a str, MessageDecodingError> {
    std::str::from_utf8(s).map_err(|_| MessageDecodingError::CannotDecodeUtf8 { command })
}

fn param<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
    index: usize,
) -> Result<&'m [u8], MessageDecodingError> {
    message
        .parameter(index)
        .ok_or(MessageDecodingError::NotEnoughParameters { command })
}

fn param_str<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
    index: usize,
) -> Result<&'m str, MessageDecodingError> {
    str2(command, param(message, command, index)?)
}

fn comma_list<'m>(
    command: &'static str,
    list: &'m [u8],
) -> Result<Vec<&'m str>, MessageDecodingError> {
    list.split(|&c| c == b',')
        .filter(|s| !s.is_empty())
        .map(|s| str2(command, s))
        .collect()
}

fn handle_pass<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    Ok(Message::Pass(param(message, command, 0)?))
}

fn handle_cap<'m>(
    _message: &vireo_parser::Message<'m>,
    _command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    // capability negotiation is not supported, the request is ignored
    Ok(Message::Cap)
}

fn handle_protoctl<'m>(
    _message: &vireo_parser::Message<'m>,
    _command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    Ok(Message::Protoctl)
}

fn handle_pong<'m>(
    _message: &vireo_parser::Message<'m>,
    _command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    Ok(Message::Pong)
}

fn handle_nick<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    Ok(Message::Nick(param(message, command, 0)?))
}

// USER <username> <mode> <unused> :<realname>
fn handle_user<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    let username = param(message, command, 0)?;
    let realname = param(message, command, 3)?;
    Ok(Message::User(username, realname))
}

fn handle_ping<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    Ok(Message::Ping(param(message, command, 0)?))
}

fn handle_quit<'m>(
    message: &vireo_parser::Message<'m>,
    _command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    Ok(Message::Quit(message.first_parameter()))
}

fn handle_join<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    let channels = comma_list(command, param(message, command, 0)?)?;
    if channels.is_empty() {
        return Err(MessageDecodingError::NotEnoughParameters { command });
    }

    // keys are positional: an empty entry means no key for that channel
    let keys = match message.parameter(1) {
        Some(keys) => keys
            .split(|&c| c == b',')
            .map(|s| str2(command, s))
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![],
    };
    Ok(Message::Join(channels, keys))
}

fn handle_part<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    let channels = comma_list(command, param(message, command, 0)?)?;
    if channels.is_empty() {
        return Err(MessageDecodingError::NotEnoughParameters { command });
    }
    Ok(Message::Part(channels, message.parameter(1)))
}

fn handle_privmsg<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    let target = param_str(message, command, 0)?;
    let content = message
        .parameter(1)
        .filter(|content| !content.is_empty())
        .ok_or(MessageDecodingError::NoTextToSend {})?;
    Ok(Message::PrivMsg(target, content))
}

fn handle_notice<'m>(
    message: &vireo_parser::Message<'m>,
    _command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    let target = message
        .first_parameter()
        .and_then(|target| std::str::from_utf8(target).ok())
        .ok_or(MessageDecodingError::SilentError {})?;
    let content = message
        .parameter(1)
        .filter(|content| !content.is_empty())
        .ok_or(MessageDecodingError::SilentError {})?;
    Ok(Message::Notice(target, content))
}

fn handle_who<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    Ok(Message::Who(param_str(message, command, 0)?))
}

fn handle_list<'m>(
    _message: &vireo_parser::Message<'m>,
    _command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    // channel and condition filters are not supported, every channel is listed
    Ok(Message::List)
}

fn handle_ison<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    // the tokens may be spread over several parameters or packed in the trailing one
    let mut tokens = vec![];
    for &p in message.parameters().iter() {
        for token in p.split(|&c| c == b' ').filter(|s| !s.is_empty()) {
            tokens.push(str2(command, token)?);
        }
    }
    if tokens.is_empty() {
        return Err(MessageDecodingError::NotEnoughParameters { command });
    }
    Ok(Message::Ison(tokens))
}

fn handle_topic<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    let channel = param_str(message, command, 0)?;
    let msg = match message.parameter(1) {
        Some(content) => Message::SetTopic(channel, content),
        None => Message::GetTopic(channel),
    };
    Ok(msg)
}

fn handle_mode<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    let target = param_str(message, command, 0)?;

    let Some(changes) = message.parameter(1) else {
        return Ok(Message::AskModeChannel(target));
    };
    let changes = str2(command, changes)?;
    let arguments = message
        .parameters()
        .iter()
        .skip(2)
        .map(|&p| str2(command, p))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Message::ChangeModeChannel(target, changes, arguments))
}

fn handle_kick<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    let channel = param_str(message, command, 0)?;
    let nickname = param_str(message, command, 1)?;
    Ok(Message::Kick(channel, nickname, message.parameter(2)))
}

fn handle_invite<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    let nickname = param_str(message, command, 0)?;
    let channel = param_str(message, command, 1)?;
    Ok(Message::Invite(nickname, channel))
}

fn handle_oper<'m>(
    message: &vireo_parser::Message<'m>,
    command: &'static str,
) -> Result<Message<'m>, MessageDecodingError> {
    let username = param(message, command, 0)?;
    let password = param(message, command, 1)?;
    Ok(Message::Oper(username, password))
}

type Handler = for<'m> fn(
    &vireo_parser::Message<'m>,
    &'static str,
) -> Result<Message<'m>, MessageDecodingError>;

/// Entry of the command table.
pub(crate) struct CommandSpec {
    pub(crate) name: &'static str,
    pub(crate) min_params: usize,
    pub(crate) access: Access,
    handler: Handler,
}

impl CommandSpec {
    const fn new(name: &'static str, min_params: usize, access: Access, handler: Handler) -> Self {
        Self {
            name,
            min_params,
            access,
            handler,
        }
    }

    pub(crate) fn decode<'m>(
        &self,
        message: &vireo_parser::Message<'m>,
    ) -> Result<Message<'m>, MessageDecodingError> {
        if message.parameters().len() < self.min_params {
            return Err(MessageDecodingError::NotEnoughParameters { command: self.name });
        }
        (self.handler)(message, self.name)
    }
}

// verbs are matched exactly, case included
static REGISTRY: phf::Map<&'static str, CommandSpec> = phf::phf_map! {
    "PASS" => CommandSpec::new("PASS", 1, Access::Open, handle_pass),
    "CAP" => CommandSpec::new("CAP", 0, Access::Open, handle_cap),
    "PROTOCTL" => CommandSpec::new("PROTOCTL", 0, Access::Open, handle_protoctl),
    "PONG" => CommandSpec::new("PONG", 0, Access::Open, handle_pong),
    "NICK" => CommandSpec::new("NICK", 1, Access::Authenticated, handle_nick),
    "USER" => CommandSpec::new("USER", 4, Access::Authenticated, handle_user),
    "PING" => CommandSpec::new("PING", 1, Access::Authenticated, handle_ping),
    "QUIT" => CommandSpec::new("QUIT", 0, Access::Authenticated, handle_quit),
    "JOIN" => CommandSpec::new("JOIN", 1, Access::Registered, handle_join),
    "PART" => CommandSpec::new("PART", 1, Access::Registered, handle_part),
    "PRIVMSG" => CommandSpec::new("PRIVMSG", 1, Access::Registered, handle_privmsg),
    "NOTICE" => CommandSpec::new("NOTICE", 0, Access::Registered, handle_notice),
    "WHO" => CommandSpec::new("WHO", 1, Access::Registered, handle_who),
    "LIST" => CommandSpec::new("LIST", 0, Access::Registered, handle_list),
    "ISON" => CommandSpec::new("ISON", 1, Access::Registered, handle_ison),
    "TOPIC" => CommandSpec::new("TOPIC", 1, Access::Registered, handle_topic),
    "MODE" => CommandSpec::new("MODE", 1, Access::Registered, handle_mode),
    "KICK" => CommandSpec::new("KICK", 2, Access::Registered, handle_kick),
    "INVITE" => CommandSpec::new("INVITE", 2, Access::Registered, handle_invite),
    "OPER" => CommandSpec::new("OPER", 2, Access::Registered, handle_oper),
};

pub(crate) fn lookup(command: &[u8]) -> Option<&'static CommandSpec> {
    let command = std::str::from_utf8(command).ok()?;
    REGISTRY.get(command)
}
