//! Chat line protocol: command parsing and server message formatting.
//!
//! Clients send newline-delimited UTF-8 lines. A line is one of:
//! - `/quit` - leave the chat
//! - `/name <newname>` - change display name
//! - `/list` - list online users
//! - `/msg <user> <text>` - private message
//! - anything else - public chat line
//!
//! Commands are matched by literal prefix in that order, so `/quitnow`
//! still quits and `/name` without a space is ordinary chat.

use thiserror::Error;

/// Parsed chat command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Leave the chat room
    Quit,

    /// Change display name (may be empty)
    Rename { name: String },

    /// List online users
    List,

    /// Private message to a single user
    Whisper { target: String, text: String },

    /// Public chat line
    Say { text: String },
}

/// Malformed `/msg` usage. Each variant has its own reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// `/msg` not followed by a space
    #[error("/msg must be followed by a space")]
    MissingSpace,
    /// `/msg <name>` with no separator before the text
    #[error("/msg needs a target and a message")]
    MissingMessage,
    /// `/msg <name> ` with nothing after the separator
    #[error("private message is empty")]
    EmptyMessage,
}

impl ParseError {
    /// Reply sent back to the offending session.
    pub fn reply(self) -> &'static str {
        match self {
            ParseError::MissingSpace => Reply::MSG_MISSING_SPACE,
            ParseError::MissingMessage => Reply::MSG_USAGE,
            ParseError::EmptyMessage => Reply::MSG_EMPTY,
        }
    }
}

/// Strip trailing carriage returns and newlines.
pub fn strip_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

/// Parse one received line.
///
/// Returns `Ok(None)` for blank lines, which are ignored without reply.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = strip_line_ending(line);

    if line.trim().is_empty() {
        return Ok(None);
    }

    let command = if line.starts_with("/quit") {
        Command::Quit
    } else if let Some(name) = line.strip_prefix("/name ") {
        Command::Rename {
            name: name.to_string(),
        }
    } else if line.starts_with("/list") {
        Command::List
    } else if let Some(rest) = line.strip_prefix("/msg ") {
        match rest.split_once(' ') {
            None => return Err(ParseError::MissingMessage),
            Some((_, "")) => return Err(ParseError::EmptyMessage),
            Some((target, text)) => Command::Whisper {
                target: target.to_string(),
                text: text.to_string(),
            },
        }
    } else if line.starts_with("/msg") {
        return Err(ParseError::MissingSpace);
    } else {
        Command::Say {
            text: line.to_string(),
        }
    };

    Ok(Some(command))
}

/// Server-generated messages. Every line ends with a single `\n`.
pub struct Reply;

impl Reply {
    pub const MSG_USAGE: &'static str = "[系统] 用法: /msg <用户名> <消息>\n";

    pub const MSG_MISSING_SPACE: &'static str = "[系统] 私聊格式错误！正确用法: /msg 用户名 消息内容\n\
                                                 [系统] 注意: /msg 后面必须有空格\n\
                                                 [系统] 示例: /msg 用户2 你好\n";

    pub const MSG_EMPTY: &'static str = "[系统] 消息内容不能为空\n";

    pub const SERVER_FULL: &'static str = "服务器已满，请稍后再试。\n";

    pub const SERVER_SHUTDOWN: &'static str = "[系统] 服务器关闭\n";

    /// Welcome and help block sent once after joining
    pub fn welcome(name: &str) -> String {
        format!(
            "欢迎来到聊天室！你的昵称是: {name}\n\
             命令列表:\n\
             \x20 /quit          - 退出聊天室\n\
             \x20 /name <昵称>   - 修改昵称\n\
             \x20 /list          - 查看在线用户\n\
             \x20 /msg <用户> <消息> - 私聊指定用户\n\
             直接输入消息则广播给所有人\n"
        )
    }

    pub fn joined(name: &str) -> String {
        format!("[系统] {name} 加入了聊天室\n")
    }

    pub fn renamed(old: &str, new: &str) -> String {
        format!("[系统] {old} 改名为 {new}\n")
    }

    pub fn left(name: &str) -> String {
        format!("[系统] {name} 离开了聊天室\n")
    }

    pub fn chat(name: &str, text: &str) -> String {
        format!("[{name}]: {text}\n")
    }

    /// Private message as delivered to its target
    pub fn whisper_received(from: &str, text: &str) -> String {
        format!("[私聊][{from} -> 你]: {text}\n")
    }

    /// Confirmation echoed to the sender of a private message
    pub fn whisper_sent(to: &str, text: &str) -> String {
        format!("[私聊][你 -> {to}]: {text}\n")
    }

    pub fn user_not_found(name: &str) -> String {
        format!("[系统] 用户 '{name}' 不在线或不存在\n")
    }

    /// Online user list; `entries` pairs each name with whether it is the
    /// requesting session.
    pub fn roster<'a, I>(entries: I) -> String
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        let mut out = String::from("[在线用户列表]\n");
        for (name, is_self) in entries {
            out.push_str("  - ");
            out.push_str(name);
            if is_self {
                out.push_str(" (你)");
            }
            out.push('\n');
        }
        out
    }
}
