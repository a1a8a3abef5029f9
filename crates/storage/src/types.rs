use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::ids::{MessageId, SessionId};

/// Placeholder title for a session that has no messages yet.
pub const DEFAULT_SESSION_TITLE: &str = "New chat";
/// Number of characters of the first message kept in a derived title.
pub const TITLE_MAX_CHARS: usize = 30;
const TITLE_ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Model,
}

/// Lifecycle of one message. Everything except `Streaming` is final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Streaming,
    Done,
    Failed(String),
    Cancelled,
}

impl MessageStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Streaming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    /// Base64 payload without a `data:` prefix.
    pub data: String,
}

impl InlineImage {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    InlineImage(InlineImage),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::InlineImage(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    pub title: String,
    pub uri: String,
}

impl Source {
    pub fn new(title: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            uri: uri.into(),
        }
    }
}

/// Citations attached to one message, unique by `uri` in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroundingSources(Vec<Source>);

impl GroundingSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `source` unless one with the same uri is already present.
    pub fn insert(&mut self, source: Source) -> bool {
        if self.0.iter().any(|existing| existing.uri == source.uri) {
            return false;
        }
        self.0.push(source);
        true
    }

    pub fn as_slice(&self) -> &[Source] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Source> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Source> for GroundingSources {
    fn from_iter<I: IntoIterator<Item = Source>>(iter: I) -> Self {
        let mut sources = Self::new();
        for source in iter {
            sources.insert(source);
        }
        sources
    }
}

impl<'a> IntoIterator for &'a GroundingSources {
    type Item = &'a Source;
    type IntoIter = std::slice::Iter<'a, Source>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub parts: Vec<Part>,
    pub grounding_sources: GroundingSources,
    pub timestamp_unix_millis: u64,
    pub status: MessageStatus,
}

impl Message {
    /// Builds a finished user turn. User messages never change after creation.
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role: MessageRole::User,
            parts,
            grounding_sources: GroundingSources::new(),
            timestamp_unix_millis: now_unix_millis(),
            status: MessageStatus::Done,
        }
    }

    /// Builds the empty model message a stream is reconciled into.
    pub fn model_placeholder() -> Self {
        Self {
            id: MessageId::new_v7(),
            role: MessageRole::Model,
            parts: vec![Part::text("")],
            grounding_sources: GroundingSources::new(),
            timestamp_unix_millis: now_unix_millis(),
            status: MessageStatus::Streaming,
        }
    }

    /// Concatenated text of every text part.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    pub fn has_text(&self) -> bool {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .any(|text| !text.is_empty())
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at_unix_millis: u64,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: SessionId::new_v7(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            created_at_unix_millis: now_unix_millis(),
        }
    }

    pub fn message(&self, message_id: MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.id == message_id)
    }

    pub(crate) fn message_mut(&mut self, message_id: MessageId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.id == message_id)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Title for a session whose first message has `text` as its text content.
pub fn derive_title(text: &str) -> String {
    if text.is_empty() {
        return DEFAULT_SESSION_TITLE.to_string();
    }

    let mut characters = text.chars();
    let mut title = characters.by_ref().take(TITLE_MAX_CHARS).collect::<String>();
    if characters.next().is_some() {
        title.push_str(TITLE_ELLIPSIS);
    }
    title
}

pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, saturating_millis)
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_saturate_instead_of_wrapping() {
        let recent = Duration::from_millis(1_700_000_000_123);
        assert_eq!(saturating_millis(recent), 1_700_000_000_123);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
        assert!(now_unix_millis() > 0);
    }

    #[test]
    fn title_keeps_short_text_verbatim() {
        assert_eq!(derive_title("Plan a trip"), "Plan a trip");
    }

    #[test]
    fn title_truncates_to_thirty_characters() {
        let text = "abcdefghijklmnopqrstuvwxyz0123456789";
        assert_eq!(derive_title(text), "abcdefghijklmnopqrstuvwxyz0123...");
        assert_eq!(derive_title(&text[..30]), &text[..30]);
    }

    #[test]
    fn title_counts_characters_not_bytes() {
        let text = "é".repeat(31);
        let title = derive_title(&text);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + TITLE_ELLIPSIS.len());
        assert!(title.starts_with(&"é".repeat(30)));
    }

    #[test]
    fn empty_text_keeps_placeholder_title() {
        assert_eq!(derive_title(""), DEFAULT_SESSION_TITLE);
    }

    #[test]
    fn grounding_sources_keep_first_seen_uri() {
        let sources = [
            Source::new("A", "http://a"),
            Source::new("B", "http://b"),
            Source::new("A again", "http://a"),
        ]
        .into_iter()
        .collect::<GroundingSources>();

        assert_eq!(
            sources.as_slice(),
            &[Source::new("A", "http://a"), Source::new("B", "http://b")]
        );
    }

    #[test]
    fn message_text_skips_image_parts() {
        let message = Message::user(vec![
            Part::text("look at "),
            Part::InlineImage(InlineImage::new("image/png", "AAAA")),
            Part::text("this"),
        ]);
        assert_eq!(message.text(), "look at this");
        assert!(message.has_text());
        assert!(message.is_final());
    }

    #[test]
    fn placeholder_starts_streaming_and_empty() {
        let placeholder = Message::model_placeholder();
        assert_eq!(placeholder.role, MessageRole::Model);
        assert_eq!(placeholder.parts, vec![Part::text("")]);
        assert!(!placeholder.has_text());
        assert!(!placeholder.is_final());
    }
}
