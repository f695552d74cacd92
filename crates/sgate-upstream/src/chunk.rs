//! Shape of one parsed stream-assist object and its dispatch into
//! `(text, thought)` pairs for the executor's chunk sink.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "streamAssistResponse")]
    stream_assist_response: Option<RawStreamAssistResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawStreamAssistResponse {
    answer: Option<RawAnswer>,
    #[serde(rename = "sessionInfo")]
    session_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawAnswer {
    state: Option<String>,
    replies: Option<Vec<RawReply>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawReply {
    #[serde(rename = "groundedContent")]
    grounded_content: Option<RawGroundedContent>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawGroundedContent {
    content: Option<RawContent>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawContent {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

/// One piece of model output pulled out of a stream-assist object.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub thought: bool,
}

/// Everything a single stream-assist object contributes: the text chunks it
/// carries plus the answer state, used by the caller to decide the terminal
/// `finishReason` once the stream closes.
#[derive(Debug, Clone, Default)]
pub struct ParsedObject {
    pub chunks: Vec<TextChunk>,
    pub state: Option<String>,
    pub session_info: Option<serde_json::Value>,
}

/// Parses one object's raw bytes and extracts its text chunks.
///
/// Per-object parse failures are not fatal to the call (§4.1): the caller is
/// expected to log and continue with the next object, so this returns
/// `Result` rather than panicking or propagating through the whole stream.
pub fn parse_object(bytes: &[u8]) -> Result<ParsedObject, serde_json::Error> {
    let raw: RawEnvelope = serde_json::from_slice(bytes)?;
    let Some(response) = raw.stream_assist_response else {
        return Ok(ParsedObject::default());
    };
    let session_info = response.session_info;
    let Some(answer) = response.answer else {
        return Ok(ParsedObject {
            session_info,
            ..Default::default()
        });
    };

    let chunks = answer
        .replies
        .unwrap_or_default()
        .into_iter()
        .filter_map(|reply| reply.grounded_content)
        .filter_map(|gc| gc.content)
        .filter_map(|content| {
            let text = content.text.unwrap_or_default();
            if text.is_empty() {
                None
            } else {
                Some(TextChunk {
                    text,
                    thought: content.thought,
                })
            }
        })
        .collect();

    Ok(ParsedObject {
        chunks,
        state: answer.state,
        session_info,
    })
}

/// Upstream `answer.state` values that are known to be terminal-normal.
pub const STATE_SUCCEEDED: &str = "SUCCEEDED";

/// Classifies a trailing answer state once the stream has closed: a
/// `SUCCEEDED` (or absent) state is a normal stop; any other terminal-looking
/// state is surfaced as `MAX_TOKENS`, per §4.1.
pub fn is_normal_stop(last_state: Option<&str>) -> bool {
    matches!(last_state, None | Some(STATE_SUCCEEDED))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_non_empty_text_replies() {
        let bytes = br#"{"streamAssistResponse":{"answer":{"state":"SUCCEEDED","replies":[
            {"groundedContent":{"content":{"text":"thinking...","thought":true}}},
            {"groundedContent":{"content":{"text":"hello"}}},
            {"groundedContent":{"content":{"text":""}}}
        ]}}}"#;
        let parsed = parse_object(bytes).unwrap();
        assert_eq!(
            parsed.chunks,
            vec![
                TextChunk { text: "thinking...".into(), thought: true },
                TextChunk { text: "hello".into(), thought: false },
            ]
        );
        assert_eq!(parsed.state.as_deref(), Some("SUCCEEDED"));
    }

    #[test]
    fn missing_answer_yields_empty_chunks() {
        let parsed = parse_object(br#"{"streamAssistResponse":{"sessionInfo":{"a":1}}}"#).unwrap();
        assert!(parsed.chunks.is_empty());
        assert!(parsed.session_info.is_some());
    }

    #[test]
    fn non_succeeded_state_is_not_a_normal_stop() {
        assert!(is_normal_stop(Some("SUCCEEDED")));
        assert!(is_normal_stop(None));
        assert!(!is_normal_stop(Some("MAX_TOKENS_REACHED")));
    }
}
