use serde::de::{Deserializer, Error as DeError};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// One piece of model output.
///
/// The wire format is a flat object with optional `thought`/`text`/`inlineData`
/// fields rather than an internally-tagged enum, so `Part` carries a manual
/// `Serialize`/`Deserialize` pair instead of deriving them.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Thought(String),
    Text(String),
    InlineData { mime_type: String, data: String },
}

impl Serialize for Part {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Part::Thought(text) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("thought", &true)?;
                map.serialize_entry("text", text)?;
                map.end()
            }
            Part::Text(text) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("text", text)?;
                map.end()
            }
            Part::InlineData { mime_type, data } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(
                    "inlineData",
                    &serde_json::json!({ "mimeType": mime_type, "data": data }),
                )?;
                map.end()
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<RawInlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInlineData {
    mime_type: String,
    data: String,
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawPart::deserialize(deserializer)?;
        if let Some(inline) = raw.inline_data {
            return Ok(Part::InlineData {
                mime_type: inline.mime_type,
                data: inline.data,
            });
        }
        let text = raw.text.unwrap_or_default();
        if raw.thought {
            Ok(Part::Thought(text))
        } else {
            Ok(Part::Text(text))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FinishReason {
    Stop,
    MaxTokens,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyCategory {
    HarmCategoryHarassment,
    HarmCategoryHateSpeech,
    HarmCategorySexuallyExplicit,
    HarmCategoryDangerousContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyRating {
    pub category: SafetyCategory,
    pub probability: SafetyProbability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SafetyProbability {
    Negligible,
}

impl SafetyRating {
    pub fn negligible_defaults() -> Vec<SafetyRating> {
        [
            SafetyCategory::HarmCategoryHarassment,
            SafetyCategory::HarmCategoryHateSpeech,
            SafetyCategory::HarmCategorySexuallyExplicit,
            SafetyCategory::HarmCategoryDangerousContent,
        ]
        .into_iter()
        .map(|category| SafetyRating {
            category,
            probability: SafetyProbability::Negligible,
        })
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelContent {
    pub role: &'static str,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: ModelContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    pub prompt_token_count: i64,
    pub candidates_token_count: i64,
    pub total_token_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    pub model_version: String,
}

impl GenerateContentResponse {
    pub fn unary(
        parts: Vec<Part>,
        finish_reason: FinishReason,
        usage: UsageMetadata,
        model_version: impl Into<String>,
    ) -> Self {
        Self {
            candidates: vec![Candidate {
                content: ModelContent {
                    role: "model",
                    parts,
                },
                finish_reason: Some(finish_reason),
                safety_ratings: SafetyRating::negligible_defaults(),
            }],
            usage_metadata: Some(usage),
            model_version: model_version.into(),
        }
    }

    /// A non-terminal streaming chunk: no `finishReason`, no `usageMetadata`.
    pub fn stream_chunk(parts: Vec<Part>, model_version: impl Into<String>) -> Self {
        Self {
            candidates: vec![Candidate {
                content: ModelContent {
                    role: "model",
                    parts,
                },
                finish_reason: None,
                safety_ratings: Vec::new(),
            }],
            usage_metadata: None,
            model_version: model_version.into(),
        }
    }
}
