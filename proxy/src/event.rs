use irc::proto::{Message, User};

/// Everything that happens on an upstream connection, in arrival order.
///
/// `DataIn`, `DataOut`, `SocketClosed`, `ConnectError` and `ErrorInfo` come
/// from the stream driver. The rest are derived by the parser from incoming
/// lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DataIn(Message),
    DataOut(Message),
    NickChange {
        old: String,
        new: String,
        ours: bool,
        /// Channels shared with the user
        channels: Vec<String>,
        message: Message,
    },
    Quit {
        user: User,
        channels: Vec<String>,
        message: Message,
    },
    /// Our own join completed with its initial NAMES reply.
    ChannelSelfJoin(String),
    ChannelJoin {
        channel: String,
        user: User,
        account: Option<String>,
        realname: Option<String>,
    },
    /// We left a channel, by PART or KICK.
    ChannelSelfLeave(String),
    Numeric(u16, Message),
    SocketClosed(Option<String>),
    ErrorInfo {
        error: String,
        line: Option<String>,
        fatal: bool,
    },
    ConnectError(String),
}
