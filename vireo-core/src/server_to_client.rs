use crate::{
    message_writer::MessageWriter,
    types::{ChannelMode, ChannelUserMode, Topic},
    Limits,
};

#[derive(Debug, Clone)]
pub(crate) struct ChannelInfo<'a> {
    pub name: &'a str,
    pub count: usize,
    pub topic: &'a [u8],
}

#[derive(Debug, Clone)]
pub(crate) struct WhoReply<'a> {
    pub(crate) channel_user_mode: &'a ChannelUserMode,
    pub(crate) nickname: &'a str,
    pub(crate) is_op: bool,
    pub(crate) hostname: &'a str,
    pub(crate) username: &'a str,
    pub(crate) realname: &'a [u8],
}

#[derive(Debug, Clone)]
pub(crate) enum Message<'a> {
    Welcome {
        nickname: &'a str,
        user_fullspec: &'a str,
        limits: &'a Limits,
    },
    #[allow(clippy::upper_case_acronyms)]
    MOTD {
        client: &'a str,
        motd: &'a [String],
    },
    Join {
        channel: &'a str,
        user_fullspec: &'a str,
    },
    Nick {
        previous_user_fullspec: &'a str,
        nickname: &'a str,
    },
    Names {
        client: &'a str,
        channel: &'a str,
        nicknames: &'a [(&'a str, &'a ChannelUserMode)],
    },
    /// reply to a GetTopic command or Join command
    RplTopic {
        client: &'a str,
        channel: &'a str,
        topic: Option<&'a Topic>,
    },
    /// reply to SetTopic by the user or another user
    Topic {
        user_fullspec: &'a str,
        channel: &'a str,
        topic: &'a Topic,
    },
    Ping {
        token: &'a [u8],
    },
    Pong {
        token: &'a [u8],
    },
    Mode {
        user_fullspec: &'a str,
        target: &'a str,
        modechar: &'a str,
        param: Option<&'a str>,
    },
    /// user mode granted by the server itself
    UserMode {
        nickname: &'a str,
        modechar: &'a str,
    },
    /// only as a reply to AskChannelMode
    ChannelMode {
        client: &'a str,
        channel: &'a str,
        mode: &'a ChannelMode,
    },
    PrivMsg {
        from_user: &'a str,
        target: &'a str,
        content: &'a [u8],
    },
    Notice {
        from_user: &'a str,
        target: &'a str,
        content: &'a [u8],
    },
    Part {
        user_fullspec: &'a str,
        channel: &'a str,
        reason: Option<&'a [u8]>,
    },
    Kick {
        user_fullspec: &'a str,
        channel: &'a str,
        target_nickname: &'a str,
        reason: &'a [u8],
    },
    Invite {
        user_fullspec: &'a str,
        target_nickname: &'a str,
        channel: &'a str,
    },
    RplInviting {
        client: &'a str,
        target_nickname: &'a str,
        channel: &'a str,
    },
    List {
        client: &'a str,
        infos: &'a [ChannelInfo<'a>],
    },
    Who {
        client: &'a str,
        mask: &'a str,
        replies: &'a [WhoReply<'a>],
    },
    RplIson {
        client: &'a str,
        nicknames: &'a [&'a str],
    },
    RplNowOff {
        client: &'a str,
        target: &'a str,
    },
    RplYoureOper {
        client: &'a str,
    },
    Quit {
        user_fullspec: &'a str,
        reason: &'a [u8],
    },
    FatalError {
        reason: &'a [u8],
    },
    Err(crate::error::ServerStateError),
}

pub(crate) struct MessageContext {
    pub(crate) server_name: String,
}

impl Message<'_> {
    pub(crate) fn write_to(&self, stream: &mut MessageWriter<'_>, context: &MessageContext) {
        let sv = &context.server_name;
        match self {
            Message::Welcome {
                nickname,
                user_fullspec,
                limits,
            } => {
                message!(
                    stream,
                    b":",
                    sv,
                    b" 001 ",
                    nickname,
                    b" :Welcome to the Internet Relay Network ",
                    user_fullspec
                );

                message!(
                    stream,
                    b":",
                    sv,
                    b" 005 ",
                    nickname,
                    b" CHANTYPES=# PREFIX=(o)@ CHANMODES=k,l,it NICKLEN=",
                    &limits.max_nickname_length.to_string(),
                    b" CHANNELLEN=",
                    &limits.max_channel_name_length.to_string(),
                    b" CASEMAPPING=ascii :are supported by this server"
                );
            }
            Message::MOTD { client, motd } => {
                if motd.is_empty() {
                    message!(
                        stream,
                        b":",
                        sv,
                        b" 422 ",
                        client,
                        b" :MOTD File is missing"
                    );
                    return;
                }

                message!(
                    stream,
                    b":",
                    sv,
                    b" 375 ",
                    client,
                    b" :- ",
                    sv,
                    b" Message of the day - "
                );

                for line in *motd {
                    message!(stream, b":", sv, b" 372 ", client, b" :- ", line);
                }

                message!(stream, b":", sv, b" 376 ", client, b" :End of MOTD command");
            }
            Message::Join {
                channel,
                user_fullspec,
            } => {
                message!(stream, b":", user_fullspec, b" JOIN ", channel);
            }
            Message::Nick {
                previous_user_fullspec,
                nickname,
            } => {
                message!(stream, b":", previous_user_fullspec, b" NICK :", nickname);
            }
            Message::Names {
                client,
                channel,
                nicknames,
            } => {
                let mut m = stream.new_message();
                message_push!(m, b":", sv, b" 353 ", client, b" = ", channel, b" :");
                for (i, (nick, user_mode)) in nicknames.iter().enumerate() {
                    if i != 0 {
                        m = m.write(b" ");
                    }
                    if user_mode.is_op() {
                        m = m.write(b"@");
                    }
                    m = m.write(nick);
                }
                m.validate();

                message!(
                    stream,
                    b":",
                    sv,
                    b" 366 ",
                    client,
                    b" ",
                    channel,
                    b" :End of NAMES list"
                );
            }
            Message::RplTopic {
                client,
                channel,
                topic,
            } => {
                if let Some(topic) = topic {
                    message!(
                        stream,
                        b":",
                        sv,
                        b" 332 ",
                        client,
                        b" ",
                        channel,
                        b" :",
                        &topic.content
                    );

                    message!(
                        stream,
                        b":",
                        sv,
                        b" 333 ",
                        client,
                        b" ",
                        channel,
                        b" ",
                        &topic.from_nickname,
                        b" ",
                        &topic.ts.to_string()
                    );
                } else {
                    message!(
                        stream,
                        b":",
                        sv,
                        b" 331 ",
                        client,
                        b" ",
                        channel,
                        b" :No topic is set"
                    );
                }
            }
            Message::Topic {
                user_fullspec,
                channel,
                topic,
            } => {
                message!(
                    stream,
                    b":",
                    user_fullspec,
                    b" TOPIC ",
                    channel,
                    b" :",
                    &topic.content
                );
            }
            Message::Ping { token } => {
                message!(stream, b":", sv, b" PING :", token);
            }
            Message::Pong { token } => {
                message!(stream, b":", sv, b" PONG ", sv, b" :", token);
            }
            Message::Mode {
                user_fullspec,
                target,
                modechar,
                param,
            } => {
                let mut m = stream.new_message();
                message_push!(m, b":", user_fullspec, b" MODE ", target, b" ", modechar);
                if let Some(param) = param {
                    message_push!(m, b" ", param);
                }
                m.validate();
            }
            Message::UserMode { nickname, modechar } => {
                message!(stream, b":", sv, b" MODE ", nickname, b" :", modechar);
            }
            Message::ChannelMode {
                client,
                channel,
                mode,
            } => {
                let mut m = stream.new_message();
                message_push!(m, b":", sv, b" 324 ", client, b" ", channel, b" +");
                if mode.is_invite_only() {
                    m = m.write(b"i");
                }
                if mode.is_topic_restricted() {
                    m = m.write(b"t");
                }
                if mode.key().is_some() {
                    m = m.write(b"k");
                }
                if mode.limit().is_some() {
                    m = m.write(b"l");
                }
                if let Some(key) = mode.key() {
                    message_push!(m, b" ", key);
                }
                if let Some(limit) = mode.limit() {
                    message_push!(m, b" ", &limit.to_string());
                }
                m.validate();
            }
            Message::PrivMsg {
                from_user,
                target,
                content,
            } => {
                message!(
                    stream,
                    b":",
                    from_user,
                    b" PRIVMSG ",
                    target,
                    b" :",
                    content
                );
            }
            Message::Notice {
                from_user,
                target,
                content,
            } => {
                message!(stream, b":", from_user, b" NOTICE ", target, b" :", content);
            }
            Message::Part {
                user_fullspec,
                channel,
                reason,
            } => {
                let mut m = stream.new_message();
                message_push!(m, b":", user_fullspec, b" PART ", channel);
                if let Some(reason) = reason {
                    message_push!(m, b" :", reason);
                }
                m.validate();
            }
            Message::Kick {
                user_fullspec,
                channel,
                target_nickname,
                reason,
            } => {
                message!(
                    stream,
                    b":",
                    user_fullspec,
                    b" KICK ",
                    channel,
                    b" ",
                    target_nickname,
                    b" :",
                    reason
                );
            }
            Message::Invite {
                user_fullspec,
                target_nickname,
                channel,
            } => {
                message!(
                    stream,
                    b":",
                    user_fullspec,
                    b" INVITE ",
                    target_nickname,
                    b" ",
                    channel
                );
            }
            Message::RplInviting {
                client,
                target_nickname,
                channel,
            } => {
                message!(
                    stream,
                    b":",
                    sv,
                    b" 341 ",
                    client,
                    b" ",
                    target_nickname,
                    b" ",
                    channel
                );
            }
            Message::List { client, infos } => {
                message!(stream, b":", sv, b" 321 ", client, b" Channel :Users  Name");

                for info in *infos {
                    message!(
                        stream,
                        b":",
                        sv,
                        b" 322 ",
                        client,
                        b" ",
                        &info.name,
                        b" ",
                        &info.count.to_string(),
                        b" :",
                        &info.topic
                    );
                }
                message!(stream, b":", sv, b" 323 ", client, b" :End of LIST");
            }
            Message::Who {
                client,
                mask,
                replies,
            } => {
                for WhoReply {
                    channel_user_mode,
                    nickname,
                    is_op,
                    hostname,
                    username,
                    realname,
                } in *replies
                {
                    let mut m = stream.new_message();
                    message_push!(
                        m,
                        b":",
                        sv,
                        b" 352 ",
                        client,
                        b" ",
                        mask,
                        b" ",
                        username,
                        b" ",
                        hostname,
                        b" ",
                        sv,
                        b" ",
                        nickname,
                        b" H"
                    );
                    if *is_op {
                        message_push!(m, b"*");
                    }
                    if channel_user_mode.is_op() {
                        message_push!(m, b"@");
                    }
                    message_push!(m, b" :0 ", realname);
                    m.validate();
                }
                message!(
                    stream,
                    b":",
                    sv,
                    b" 315 ",
                    client,
                    b" ",
                    mask,
                    b" :End of WHO list"
                );
            }
            Message::RplIson { client, nicknames } => {
                let mut m = stream.new_message();
                message_push!(m, b":", sv, b" 303 ", client, b" :");
                for (i, nickname) in nicknames.iter().enumerate() {
                    if i != 0 {
                        m = m.write(b" ");
                    }
                    m = m.write(nickname);
                }
                m.validate();
            }
            Message::RplNowOff { client, target } => {
                message!(
                    stream,
                    b":",
                    sv,
                    b" 605 ",
                    client,
                    b" ",
                    target,
                    b" * * 0 :is offline"
                );
            }
            Message::RplYoureOper { client } => {
                message!(
                    stream,
                    b":",
                    sv,
                    b" 381 ",
                    client,
                    b" :You are now an IRC operator"
                );
            }
            Message::Quit {
                user_fullspec,
                reason,
            } => {
                message!(stream, b":", user_fullspec, b" QUIT :", reason);
            }
            Message::FatalError { reason } => {
                message!(stream, b":", sv, b" ERROR :", reason);
            }
            Message::Err(err) => {
                let mut m = stream.new_message();
                message_push!(m, b":", sv, b" ");
                err.write_to(m).validate();
            }
        }
    }
}
