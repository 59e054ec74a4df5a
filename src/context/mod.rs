//! Conversation context
//!
//! Ordered, mutable log of chat turns mixing text and image attachments,
//! with a conversation-wide image budget. This is pure state management; it
//! has no dependency on the inference engine.
//!
//! Images arrive as tagged data URIs (`"<tag>|data:image/png;base64,<payload>"`)
//! and are stored as an OpenAI-style content-block pair: a `tag=<tag>` text
//! marker followed by an `image_url` block.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::storage::StorageError;
use crate::types::Role;

/// Fixed assistant persona, seeded as the first system turn of every context.
pub const BASE_PROMPT: &str = "you are an intelligent assistant designed to help students with their \
     lectures. You can respond to student queries about lecture content, provide \
     explanations using relevant images from your memory, and assist with topics \
     by analyzing textbook images uploaded by students. Use the combined audio \
     and visual data to give accurate, contextually appropriate answers, \
     enhancing the students' learning experience. All your responses should be \
     in the form of Markdown text";

const DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// Nested image reference, matching the persisted wire shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One atomic unit within a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Turn content as the engine and the persisted file see it: a plain string
/// for simple turns, a block array for turns carrying attachments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One role-attributed entry of the rendered turn log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnMessage {
    pub role: Role,
    pub content: TurnContent,
}

/// One exchange unit: a role plus an ordered sequence of content blocks
#[derive(Debug, Clone)]
pub struct ChatTurn {
    role: Role,
    blocks: Vec<ContentBlock>,
    text_added: bool,
}

impl ChatTurn {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            blocks: Vec::new(),
            text_added: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Add the turn's text. A turn accepts at most one text contribution;
    /// further attempts are rejected and the original text is kept.
    pub fn add_text(&mut self, text: &str) -> bool {
        if self.text_added {
            tracing::warn!(
                role = %self.role,
                "text has already been submitted to this turn, keeping the original"
            );
            return false;
        }

        self.blocks.insert(
            0,
            ContentBlock::Text {
                text: text.to_string(),
            },
        );
        self.text_added = true;
        true
    }

    /// Add a tagged image (`"<tag>|data:image/png;base64,<payload>"`).
    ///
    /// Malformed input and duplicate URIs are dropped with a warning.
    /// Returns true when an image block was actually added.
    pub fn add_image(&mut self, tagged: &str) -> bool {
        let Some((tag, uri)) = tagged.split_once('|') else {
            tracing::warn!("image is missing its tag separator, omitting");
            return false;
        };

        let tag = tag.trim();
        let uri = uri.trim();
        if tag.is_empty() || !uri.starts_with(DATA_URI_PREFIX) {
            tracing::warn!("image is not a tagged png data uri, omitting");
            return false;
        }

        if self.has_image(uri) {
            tracing::warn!(tag, "image already attached to this turn, omitting");
            return false;
        }

        self.blocks.push(ContentBlock::Text {
            text: format!("tag={tag}"),
        });
        self.blocks.push(ContentBlock::ImageUrl {
            image_url: ImageUrl {
                url: uri.to_string(),
            },
        });

        tracing::debug!(tag, size = %redact_data_uri(uri), "attached image");
        true
    }

    fn has_image(&self, uri: &str) -> bool {
        self.blocks.iter().any(|block| match block {
            ContentBlock::ImageUrl { image_url } => image_url.url == uri,
            ContentBlock::Text { .. } => false,
        })
    }

    /// Number of image blocks in this turn.
    pub fn image_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|block| matches!(block, ContentBlock::ImageUrl { .. }))
            .count()
    }

    /// The turn's text contribution, if any. The text block is always the
    /// first block of the turn, so it is tracked positionally; user text
    /// may legitimately start with `tag=`.
    pub fn text(&self) -> Option<&str> {
        if !self.text_added {
            return None;
        }
        match self.blocks.first() {
            Some(ContentBlock::Text { text }) => Some(text.as_str()),
            _ => None,
        }
    }

    /// Render this turn in the shape the engine and the persisted file use.
    ///
    /// User turns always render as block arrays; system and assistant turns
    /// collapse to a plain string while they carry no attachments.
    pub fn to_message(&self) -> TurnMessage {
        let content = if self.role != Role::User && self.image_count() == 0 {
            TurnContent::Text(self.text().unwrap_or_default().to_string())
        } else {
            TurnContent::Blocks(self.blocks.clone())
        };

        TurnMessage {
            role: self.role,
            content,
        }
    }

    /// Rebuild a turn from its persisted form.
    pub fn from_message(message: &TurnMessage) -> Self {
        match &message.content {
            TurnContent::Text(text) => {
                let mut turn = ChatTurn::new(message.role);
                turn.add_text(text);
                turn
            }
            TurnContent::Blocks(blocks) => {
                // the text block is always first; a tag marker is always
                // followed immediately by its image block
                let text_added = matches!(blocks.first(), Some(ContentBlock::Text { .. }))
                    && !matches!(blocks.get(1), Some(ContentBlock::ImageUrl { .. }));
                Self {
                    role: message.role,
                    blocks: blocks.clone(),
                    text_added,
                }
            }
        }
    }
}

/// Ordered conversation log with a global image budget
///
/// Seeded at construction with one system turn carrying [`BASE_PROMPT`].
/// The full log is rendered verbatim as the generation prompt on every
/// turn; no truncation or windowing is performed, so growth is unbounded
/// across a session (known scaling limit).
#[derive(Debug)]
pub struct ChatContext {
    turns: Vec<ChatTurn>,
    total_images: usize,
    max_images: usize,
}

impl ChatContext {
    pub fn new(max_images: usize) -> Self {
        let mut system = ChatTurn::new(Role::System);
        system.add_text(BASE_PROMPT);

        Self {
            turns: vec![system],
            total_images: 0,
            max_images,
        }
    }

    /// Append a new turn.
    ///
    /// Images beyond the conversation budget are silently omitted (with a
    /// diagnostic) rather than failing the request; the text portion of the
    /// turn still lands. Accepted images increment the running counter.
    pub fn append(&mut self, role: Role, text: Option<&str>, images: Option<&[String]>) {
        let mut turn = ChatTurn::new(role);

        if let Some(text) = text {
            turn.add_text(text);
        }

        if let Some(images) = images {
            for tagged in images {
                if self.total_images >= self.max_images {
                    tracing::warn!(
                        max_images = self.max_images,
                        "image budget reached, omitting remaining attachments"
                    );
                    break;
                }
                if turn.add_image(tagged) {
                    self.total_images += 1;
                }
            }
        }

        self.turns.push(turn);
    }

    /// The full ordered turn log, in the exact shape the engine expects.
    pub fn render(&self) -> Vec<TurnMessage> {
        self.turns.iter().map(ChatTurn::to_message).collect()
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn total_images(&self) -> usize {
        self.total_images
    }

    pub fn max_images(&self) -> usize {
        self.max_images
    }

    /// Serialize the full turn log to a pretty-printed JSON file.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.render())?;
        std::fs::write(path, json)?;

        tracing::info!("context saved to {}", path.display());
        Ok(())
    }

    /// Replace the in-memory log wholesale with the contents of a persisted
    /// context file. The image counter is recomputed from the restored turns.
    pub fn restore(&mut self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let messages: Vec<TurnMessage> = serde_json::from_str(&raw)?;

        self.turns = messages.iter().map(ChatTurn::from_message).collect();
        self.total_images = self.turns.iter().map(ChatTurn::image_count).sum();

        tracing::info!("context loaded from {}", path.display());
        Ok(())
    }

    /// Redacted textual rendering for logs: every image payload is replaced
    /// with its decoded byte length so raw image data never leaks into logs.
    pub fn describe(&self) -> String {
        let redacted: Vec<TurnMessage> = self
            .render()
            .into_iter()
            .map(|mut message| {
                if let TurnContent::Blocks(blocks) = &mut message.content {
                    for block in blocks {
                        if let ContentBlock::ImageUrl { image_url } = block {
                            image_url.url = redact_data_uri(&image_url.url);
                        }
                    }
                }
                message
            })
            .collect();

        serde_json::to_string_pretty(&redacted).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Replace a data URI's payload with its decoded byte length.
fn redact_data_uri(uri: &str) -> String {
    let payload = uri.split_once(',').map(|(_, p)| p).unwrap_or("");
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map(|decoded| decoded.len())
        .unwrap_or(payload.len());

    format!("{DATA_URI_PREFIX}{bytes}bytes")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: &str, payload: &str) -> String {
        format!("{tag}|{DATA_URI_PREFIX}{payload}")
    }

    #[test]
    fn test_seeded_with_system_prompt() {
        let context = ChatContext::new(5);
        assert_eq!(context.turn_count(), 1);
        assert_eq!(context.turns()[0].role(), Role::System);
        assert_eq!(context.turns()[0].text(), Some(BASE_PROMPT));
    }

    #[test]
    fn test_single_text_contribution() {
        let mut turn = ChatTurn::new(Role::User);
        assert!(turn.add_text("first"));
        assert!(!turn.add_text("second"));
        assert_eq!(turn.text(), Some("first"));
    }

    #[test]
    fn test_duplicate_image_is_noop() {
        let mut turn = ChatTurn::new(Role::User);
        let image = tagged("img1", "aGVsbG8=");
        assert!(turn.add_image(&image));
        assert!(!turn.add_image(&image));
        assert_eq!(turn.image_count(), 1);
    }

    #[test]
    fn test_malformed_images_are_dropped() {
        let mut turn = ChatTurn::new(Role::User);
        assert!(!turn.add_image("no-separator"));
        assert!(!turn.add_image("|data:image/png;base64,aGk="));
        assert!(!turn.add_image("tag|https://example.com/cat.png"));
        assert_eq!(turn.image_count(), 0);
    }

    #[test]
    fn test_image_budget_partial_acceptance() {
        let mut context = ChatContext::new(2);
        let images = vec![
            tagged("a", "YQ=="),
            tagged("b", "Yg=="),
            tagged("c", "Yw=="),
        ];
        context.append(Role::User, Some("look at these"), Some(&images));

        assert_eq!(context.total_images(), 2);
        let turn = &context.turns()[1];
        assert_eq!(turn.image_count(), 2);
        // text survives even though an attachment was dropped
        assert_eq!(turn.text(), Some("look at these"));
    }

    #[test]
    fn test_budget_spans_turns() {
        let mut context = ChatContext::new(2);
        context.append(Role::User, Some("one"), Some(&[tagged("a", "YQ==")]));
        context.append(Role::User, Some("two"), Some(&[tagged("b", "Yg==")]));
        context.append(Role::User, Some("three"), Some(&[tagged("c", "Yw==")]));

        assert_eq!(context.total_images(), 2);
        assert_eq!(context.turns()[3].image_count(), 0);
        assert_eq!(context.turns()[3].text(), Some("three"));
    }

    #[test]
    fn test_render_shapes() {
        let mut context = ChatContext::new(5);
        context.append(Role::User, Some("hi"), None);
        context.append(Role::Assistant, Some("hello"), None);

        let rendered = context.render();
        assert_eq!(rendered.len(), 3);

        // system and assistant turns collapse to plain strings
        assert!(matches!(&rendered[0].content, TurnContent::Text(t) if t == BASE_PROMPT));
        assert!(matches!(&rendered[2].content, TurnContent::Text(t) if t == "hello"));

        // user turns are always block arrays
        match &rendered[1].content {
            TurnContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 1);
                assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "hi"));
            }
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn test_image_blocks_are_tag_then_url() {
        let mut context = ChatContext::new(5);
        context.append(
            Role::User,
            Some("see"),
            Some(&[tagged("fig2", "aGVsbG8=")]),
        );

        match &context.render()[1].content {
            TurnContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 3);
                assert!(matches!(&blocks[1], ContentBlock::Text { text } if text == "tag=fig2"));
                assert!(matches!(
                    &blocks[2],
                    ContentBlock::ImageUrl { image_url }
                        if image_url.url == format!("{DATA_URI_PREFIX}aGVsbG8=")
                ));
            }
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn test_text_starting_with_tag_prefix() {
        let mut turn = ChatTurn::new(Role::User);
        turn.add_text("tag=physics is my favorite topic");
        turn.add_image(&tagged("fig1", "aGk="));
        assert_eq!(turn.text(), Some("tag=physics is my favorite topic"));

        let mut restored = ChatTurn::from_message(&turn.to_message());
        assert_eq!(restored.text(), Some("tag=physics is my favorite topic"));
        assert_eq!(restored.image_count(), 1);
        assert!(!restored.add_text("second"));
    }

    #[test]
    fn test_image_only_turn_restores_without_text() {
        let mut turn = ChatTurn::new(Role::User);
        turn.add_image(&tagged("fig2", "aGk="));

        let restored = ChatTurn::from_message(&turn.to_message());
        assert_eq!(restored.text(), None);
        assert_eq!(restored.image_count(), 1);
        // the restored turn still accepts its one text contribution
        assert!(restored.clone().add_text("late text"));
    }

    #[test]
    fn test_persist_restore_round_trip() {
        let mut context = ChatContext::new(5);
        context.append(Role::User, Some("hi"), Some(&[tagged("a", "YQ==")]));
        context.append(Role::Assistant, Some("hello there"), None);
        context.append(Role::User, Some("bye"), None);

        let file = tempfile::NamedTempFile::new().unwrap();
        context.persist(file.path()).unwrap();

        let mut restored = ChatContext::new(5);
        restored.restore(file.path()).unwrap();

        assert_eq!(restored.render(), context.render());
        assert_eq!(restored.total_images(), 1);
    }

    #[test]
    fn test_restore_replaces_wholesale() {
        let file = tempfile::NamedTempFile::new().unwrap();
        ChatContext::new(5).persist(file.path()).unwrap();

        let mut context = ChatContext::new(5);
        context.append(Role::User, Some("stale"), None);
        context.restore(file.path()).unwrap();

        assert_eq!(context.turn_count(), 1);
        assert_eq!(context.total_images(), 0);
    }

    #[test]
    fn test_describe_redacts_payloads() {
        let mut context = ChatContext::new(5);
        // "aGVsbG8=" decodes to 5 bytes
        context.append(Role::User, Some("look"), Some(&[tagged("a", "aGVsbG8=")]));

        let description = context.describe();
        assert!(!description.contains("aGVsbG8="));
        assert!(description.contains("5bytes"));
        assert!(description.contains("look"));
    }

    #[test]
    fn test_wire_shape_of_blocks() {
        let block = ContentBlock::ImageUrl {
            image_url: ImageUrl {
                url: "data:image/png;base64,YQ==".to_string(),
            },
        };
        let json = serde_json::to_string(&block).unwrap();
        assert_eq!(
            json,
            r#"{"type":"image_url","image_url":{"url":"data:image/png;base64,YQ=="}}"#
        );

        let text = ContentBlock::Text {
            text: "hi".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&text).unwrap(),
            r#"{"type":"text","text":"hi"}"#
        );
    }
}
