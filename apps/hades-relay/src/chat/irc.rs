//! IRCv3 line parsing for Twitch chat.

use relay_bus::{ChatMessage, RawChatEvent};
use serde_json::{Map, Value};

const ACTION_PREFIX: &str = "\u{1}ACTION ";

/// Parses one IRC line (without the trailing CRLF). Returns `None` for blank
/// lines or lines without a command.
pub fn parse_line(line: &str) -> Option<RawChatEvent> {
    let raw = line.trim_end_matches(['\r', '\n']);
    let mut rest = raw.trim_start();
    if rest.is_empty() {
        return None;
    }

    let mut tags = Map::new();
    if let Some(stripped) = rest.strip_prefix('@') {
        let (tag_block, remainder) = stripped.split_once(' ')?;
        tags = parse_tags(tag_block);
        rest = remainder.trim_start();
    }

    let mut prefix = None;
    if let Some(stripped) = rest.strip_prefix(':') {
        let (source, remainder) = stripped.split_once(' ')?;
        prefix = Some(source.to_string());
        rest = remainder.trim_start();
    }

    let (command, mut rest) = match rest.split_once(' ') {
        Some((command, remainder)) => (command, remainder),
        None => (rest, ""),
    };
    if command.is_empty() {
        return None;
    }

    let mut params = Vec::new();
    loop {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }
        if let Some(trailing) = rest.strip_prefix(':') {
            params.push(trailing.to_string());
            break;
        }
        match rest.split_once(' ') {
            Some((param, remainder)) => {
                params.push(param.to_string());
                rest = remainder;
            }
            None => {
                params.push(rest.to_string());
                break;
            }
        }
    }

    Some(RawChatEvent {
        raw: raw.to_string(),
        tags,
        prefix,
        command: command.to_ascii_uppercase(),
        params,
    })
}

fn parse_tags(block: &str) -> Map<String, Value> {
    block
        .split(';')
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), Value::String(unescape_tag(value))),
            None => (entry.to_string(), Value::Bool(true)),
        })
        .collect()
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Builds the chat-message view of a `PRIVMSG`, tagging `/me` actions the way
/// chat clients conventionally do.
pub fn chat_message(event: &RawChatEvent) -> Option<ChatMessage> {
    if event.command != "PRIVMSG" || event.params.len() < 2 {
        return None;
    }
    let channel = event.params[0].clone();
    let text = &event.params[1];
    let mut tags = event.tags.clone();

    let message = match text.strip_prefix(ACTION_PREFIX) {
        Some(action) => {
            tags.insert("message-type".into(), Value::String("action".into()));
            action.trim_end_matches('\u{1}').to_string()
        }
        None => {
            tags.insert("message-type".into(), Value::String("chat".into()));
            text.clone()
        }
    };
    if let Some(login) = event
        .prefix
        .as_deref()
        .and_then(|prefix| prefix.split('!').next())
    {
        tags.entry("username")
            .or_insert_with(|| Value::String(login.to_string()));
    }

    Some(ChatMessage {
        channel,
        tags,
        message,
        is_self: false,
    })
}
