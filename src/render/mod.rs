use crate::filters::rules::MatchInfo;
use crate::notify::types::{RecipientKind, SourceMessage, SourcePeer};

/// Fallback used when a filter configures no template of its own.
pub const DEFAULT_TEMPLATE: &str = "{{chat_title}}: {{text}}\n{{message_link}}";

/// Public t.me link to the matched message, when one exists.
///
/// Channels and supergroups always have one (by username or the private
/// `/c/` form); users link to their profile; legacy groups and private
/// users have no stable link.
pub fn message_link(peer: &SourcePeer, msg_id: i32) -> String {
    match peer.kind {
        RecipientKind::Channel => match &peer.username {
            Some(username) if !username.is_empty() => {
                format!("https://t.me/{username}/{msg_id}")
            }
            _ => format!("https://t.me/c/{}/{}", peer.id, msg_id),
        },
        RecipientKind::User => match &peer.username {
            Some(username) if !username.is_empty() => format!("https://t.me/{username}"),
            _ => String::new(),
        },
        RecipientKind::Chat => String::new(),
    }
}

/// Literal placeholder substitution; no escaping, no conditionals.
/// Missing values render empty except `{{message_link}}`, which renders
/// `-` so the notification layout stays stable.
pub fn render_template(template: &str, message: &SourceMessage, info: &MatchInfo) -> String {
    let template = if template.is_empty() {
        DEFAULT_TEMPLATE
    } else {
        template
    };

    let link = message_link(&message.peer, message.id);
    let link = if link.is_empty() { "-".to_string() } else { link };
    let title = message.peer.title.clone().unwrap_or_default();
    let keywords = info.keywords.join(", ");
    let regex_match = info.regex_match.clone().unwrap_or_default();

    template
        .replace("{{message_link}}", &link)
        .replace("{{chat_title}}", &title)
        .replace("{{text}}", &message.text)
        .replace("{{keywords}}", &keywords)
        .replace("{{regex}}", &regex_match)
}
