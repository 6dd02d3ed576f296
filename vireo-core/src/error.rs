use crate::client_to_server::MessageDecodingError;
use crate::message_writer::OnGoingMessage;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServerStateError {
    #[error("400 {client} {command} :{info}")]
    UnknownError {
        client: String,
        command: String,
        info: String,
    },
    #[error("401 {client} {target} :No such nick/channel")]
    NoSuchNick { client: String, target: String },
    #[error("403 {client} {channel} :No such channel")]
    NoSuchChannel { client: String, channel: String },
    #[error("404 {client} {channel} :Cannot send to channel")]
    CannotSendToChan { client: String, channel: String },
    #[error("412 {client} :No text to send")]
    NoTextToSend { client: String },
    #[error("421 {client} {command} :Unknown command")]
    UnknownCommand { client: String, command: String },
    #[error("432 {client} {nickname} :Erroneous nickname")]
    ErroneousNickname { client: String, nickname: String },
    #[error("433 {client} {nickname} :Nickname is already in use")]
    NicknameInUse { client: String, nickname: String },
    #[error("441 {client} {nickname} {channel} :They aren't on that channel")]
    UserNotInChannel {
        client: String,
        nickname: String,
        channel: String,
    },
    #[error("442 {client} {channel} :You're not on that channel")]
    NotOnChannel { client: String, channel: String },
    #[error("443 {client} {nickname} {channel} :is already on channel")]
    UserOnChannel {
        client: String,
        nickname: String,
        channel: String,
    },
    #[error("451 {client} :You have not registered")]
    NotRegistered { client: String },
    #[error("461 {client} {command} :Not enough parameters")]
    NeedMoreParams { client: String, command: String },
    #[error("462 {client} :You may not reregister")]
    AlreadyRegistered { client: String },
    #[error("464 {client} :Password incorrect")]
    PasswdMismatch { client: String },
    #[error("467 {client} {channel} :Channel key already set")]
    KeySet { client: String, channel: String },
    #[error("471 {client} {channel} :Cannot join channel (+l)")]
    ChannelIsFull { client: String, channel: String },
    #[error("472 {client} {modechar} :is unknown mode char to me")]
    UnknownMode { client: String, modechar: String },
    #[error("473 {client} {channel} :Cannot join channel (+i)")]
    InviteOnlyChan { client: String, channel: String },
    #[error("475 {client} {channel} :Cannot join channel (+k)")]
    BadChannelKey { client: String, channel: String },
    #[error("476 {client} {channel} :Bad Channel Mask")]
    BadChanMask { client: String, channel: String },
    #[error("482 {client} {channel} :You're not channel operator")]
    ChanOpPrivsNeeded { client: String, channel: String },
    #[error("525 {client} {channel} :Key is not well-formed")]
    InvalidKey { client: String, channel: String },
}

impl ServerStateError {
    pub(crate) fn write_to<'b, 'c>(&self, m: OnGoingMessage<'b, 'c>) -> OnGoingMessage<'b, 'c> {
        m.write(&self.to_string())
    }

    pub(crate) fn from_decoding_error_with_client(
        err: MessageDecodingError,
        client: String,
    ) -> Option<ServerStateError> {
        let err = match err {
            MessageDecodingError::CannotDecodeUtf8 { command } => ServerStateError::UnknownError {
                client,
                command: command.to_string(),
                info: "Cannot decode utf8".to_string(),
            },
            MessageDecodingError::NotEnoughParameters { command } => {
                ServerStateError::NeedMoreParams {
                    client,
                    command: command.to_string(),
                }
            }
            MessageDecodingError::NoTextToSend {} => ServerStateError::NoTextToSend { client },
            MessageDecodingError::SilentError {} => return None,
        };
        Some(err)
    }
}
