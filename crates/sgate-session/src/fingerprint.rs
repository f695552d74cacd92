//! Content-addressed fingerprints used to recognize a continuing
//! conversation without a client-supplied session id (§4.2).

use rand::Rng;
use rand::distr::Alphanumeric;
use sgate_protocol::gemini::request::{Content, Role};

const ANCHOR_LEN: usize = 5;
const JOIN: &str = "|||";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub head_hash: String,
    pub tail_hash: String,
}

/// Derives the head/tail fingerprint pair from a conversation's user turns.
///
/// With no user turns at all, both hashes are seeded from a random string so
/// the pair can never coincide with a real conversation (a guaranteed cache
/// miss rather than an accidental collision on the empty string).
pub fn fingerprint(contents: &[Content]) -> Fingerprint {
    let user_texts: Vec<String> = contents
        .iter()
        .filter(|c| matches!(c.role, Some(Role::User) | None))
        .map(Content::text)
        .collect();

    if user_texts.is_empty() {
        return Fingerprint {
            head_hash: hash(&random_salt()),
            tail_hash: hash(&random_salt()),
        };
    }

    let head_n = ANCHOR_LEN.min(user_texts.len());
    let tail_n = ANCHOR_LEN.min(user_texts.len());
    let head_text = user_texts[..head_n].join(JOIN);
    let tail_text = user_texts[user_texts.len() - tail_n..].join(JOIN);

    Fingerprint {
        head_hash: hash(&head_text),
        tail_hash: hash(&tail_text),
    }
}

fn hash(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn random_salt() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgate_protocol::gemini::request::InputPart;

    fn user(text: &str) -> Content {
        Content {
            role: Some(Role::User),
            parts: vec![InputPart {
                text: Some(text.to_string()),
            }],
        }
    }

    fn model(text: &str) -> Content {
        Content {
            role: Some(Role::Model),
            parts: vec![InputPart {
                text: Some(text.to_string()),
            }],
        }
    }

    #[test]
    fn empty_conversation_yields_non_colliding_random_hashes() {
        let a = fingerprint(&[]);
        let b = fingerprint(&[]);
        assert_ne!(a.head_hash, b.head_hash);
        assert_ne!(a.tail_hash, b.tail_hash);
    }

    #[test]
    fn short_conversation_uses_all_user_turns_for_both_anchors() {
        let contents = vec![user("hi"), model("hello"), user("how are you")];
        let fp = fingerprint(&contents);
        assert_eq!(fp.head_hash, fp.tail_hash);
    }

    #[test]
    fn long_conversation_head_and_tail_diverge() {
        let contents: Vec<Content> = (0..12)
            .flat_map(|i| vec![user(&format!("turn {i}")), model("ack")])
            .collect();
        let fp = fingerprint(&contents);
        assert_ne!(fp.head_hash, fp.tail_hash);
    }

    #[test]
    fn identical_conversations_produce_identical_fingerprints() {
        let contents = vec![user("same question")];
        assert_eq!(fingerprint(&contents), fingerprint(&contents));
    }

    #[test]
    fn non_empty_text_never_hashes_like_the_empty_conversation() {
        let contents = vec![user("x")];
        let fp = fingerprint(&contents);
        let empty = fingerprint(&[]);
        assert_ne!(fp.head_hash, empty.head_hash);
    }
}
