//! Model-name aliasing and token estimation (§4.4).

use sgate_protocol::gemini::ModelDescriptor;

/// Fixed public-name -> upstream-model-id alias table. Unknown names pass
/// through unchanged once the `models/` prefix (if any) is stripped.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("gemini-2.5-pro", "upstream-pro-v2"),
    ("gemini-2.5-flash", "upstream-flash-v2"),
    ("gemini-2.0-flash", "upstream-flash-v1"),
];

pub fn strip_models_prefix(name: &str) -> &str {
    name.strip_prefix("models/").unwrap_or(name)
}

/// The catalog served by `GET /v1beta/models` — just the alias table's public
/// names, since those are the only ones this gateway can actually route.
pub fn known_models() -> Vec<ModelDescriptor> {
    MODEL_ALIASES
        .iter()
        .map(|(public, _)| ModelDescriptor {
            name: format!("models/{public}"),
            display_name: (*public).to_string(),
            description: format!("{public}, routed to the configured provider pool"),
        })
        .collect()
}

/// `GET /v1beta/models/{model}` — looks the bare name up in the same table.
pub fn describe_model(public_name: &str) -> Option<ModelDescriptor> {
    let stripped = strip_models_prefix(public_name);
    MODEL_ALIASES
        .iter()
        .find(|(public, _)| *public == stripped)
        .map(|(public, _)| ModelDescriptor {
            name: format!("models/{public}"),
            display_name: (*public).to_string(),
            description: format!("{public}, routed to the configured provider pool"),
        })
}

pub fn map_model(public_name: &str) -> String {
    let stripped = strip_models_prefix(public_name);
    MODEL_ALIASES
        .iter()
        .find(|(public, _)| *public == stripped)
        .map(|(_, upstream)| upstream.to_string())
        .unwrap_or_else(|| stripped.to_string())
}

/// `ceil(cjk_chars/1.5 + other_chars/4)`, the estimator used for
/// `usageMetadata` since the upstream protocol carries no token counts.
pub fn estimate_tokens(text: &str) -> i64 {
    let (cjk, other) = text.chars().fold((0u64, 0u64), |(cjk, other), c| {
        if is_cjk(c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    let estimate = (cjk as f64) / 1.5 + (other as f64) / 4.0;
    estimate.ceil() as i64
}

fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xAC00..=0xD7A3
    )
}

/// Media is requested when the generation config lists an `IMAGE` modality,
/// or the last user-facing text contains one of these keywords (§4.4).
pub fn default_media_keywords() -> Vec<String> {
    [
        "draw",
        "generate an image",
        "generate a picture",
        "sketch",
        "illustrate",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_alias_maps_to_upstream_id() {
        assert_eq!(map_model("gemini-2.5-pro"), "upstream-pro-v2");
        assert_eq!(map_model("models/gemini-2.5-pro"), "upstream-pro-v2");
    }

    #[test]
    fn unknown_model_passes_through_stripped() {
        assert_eq!(map_model("models/some-future-model"), "some-future-model");
    }

    #[test]
    fn describe_model_accepts_both_bare_and_prefixed_names() {
        assert!(describe_model("gemini-2.5-pro").is_some());
        assert!(describe_model("models/gemini-2.5-pro").is_some());
        assert!(describe_model("models/not-a-real-model").is_none());
    }

    #[test]
    fn known_models_covers_the_whole_alias_table() {
        assert_eq!(known_models().len(), MODEL_ALIASES.len());
    }

    #[test]
    fn ascii_text_uses_four_chars_per_token() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn cjk_text_uses_one_point_five_chars_per_token() {
        assert_eq!(estimate_tokens("你好"), 2);
    }

    #[test]
    fn mixed_text_sums_both_estimators() {
        let tokens = estimate_tokens("你好world");
        assert_eq!(tokens, ((2.0 / 1.5) + (5.0 / 4.0)).ceil() as i64);
    }
}
