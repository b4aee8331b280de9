//! Tokenizer Interface: pluggable string↔token conversion with
//! chat-template formatting (spec §4's "Tokenizer Interface", §6 "Tokenizer
//! facade").
//!
//! The core never implements a specific tokenizer algorithm (BPE, SentencePiece,
//! …) — it depends only on this trait, exactly as spec §1 describes
//! tokenizers as "pluggable string↔token converters with a fixed
//! interface". `ReferenceByteTokenizer` below exists for this crate's own
//! tests and as a worked example of the trait.

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplateKind {
    /// `role: content\n` per message, a trailing `assistant:` prompt.
    Simple,
}

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, ids: &[u32]) -> String;
    fn decode_piece(&self, id: u32) -> String;
    fn apply_chat_template(&self, messages: &[ChatMessage], kind: ChatTemplateKind) -> String;
    fn eos_id(&self) -> Option<u32>;
}

/// A byte-level reference tokenizer: token id `b` is the UTF-8 byte `b`
/// for `b < 256`; id `256` is end-of-sequence. Deterministic and
/// dependency-free, used by this crate's own integration tests in place
/// of a production BPE/SentencePiece tokenizer.
pub struct ReferenceByteTokenizer;

impl Tokenizer for ReferenceByteTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.as_bytes().iter().map(|&b| b as u32).collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id < 256)
            .map(|&id| id as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn decode_piece(&self, id: u32) -> String {
        self.decode(&[id])
    }

    fn apply_chat_template(&self, messages: &[ChatMessage], kind: ChatTemplateKind) -> String {
        match kind {
            ChatTemplateKind::Simple => {
                let mut out = String::new();
                for m in messages {
                    out.push_str(&m.role);
                    out.push_str(": ");
                    out.push_str(&m.content);
                    out.push('\n');
                }
                out.push_str("assistant: ");
                out
            }
        }
    }

    fn eos_id(&self) -> Option<u32> {
        Some(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_tokenizer_round_trips_ascii() {
        let tok = ReferenceByteTokenizer;
        let ids = tok.encode("hi");
        assert_eq!(tok.decode(&ids), "hi");
    }

    #[test]
    fn chat_template_formats_messages_and_prompt() {
        let tok = ReferenceByteTokenizer;
        let messages = vec![ChatMessage { role: "user".into(), content: "hello".into() }];
        let text = tok.apply_chat_template(&messages, ChatTemplateKind::Simple);
        assert!(text.contains("user: hello"));
        assert!(text.ends_with("assistant: "));
    }

    #[test]
    fn eos_id_is_stable() {
        let tok = ReferenceByteTokenizer;
        assert_eq!(tok.eos_id(), Some(256));
    }
}
