use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub parts: Vec<InputPart>,
}

impl Content {
    /// Concatenation of this content's text parts, joined by newline, matching
    /// the fingerprinting input the session matcher hashes.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Text,
    Image,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_modalities: Option<Vec<Modality>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    #[serde(default)]
    pub include_thoughts: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequestBody {
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

impl GenerateContentRequestBody {
    pub fn wants_media(&self, media_keywords: &[String]) -> bool {
        let wants_image_modality = self
            .generation_config
            .as_ref()
            .and_then(|config| config.response_modalities.as_ref())
            .is_some_and(|modalities| modalities.contains(&Modality::Image));
        if wants_image_modality {
            return true;
        }
        let Some(last_text) = self
            .contents
            .iter()
            .rev()
            .find(|content| !content.text().is_empty())
            .map(|content| content.text().to_lowercase())
        else {
            return false;
        };
        media_keywords
            .iter()
            .any(|keyword| last_text.contains(&keyword.to_lowercase()))
    }

    pub fn include_thoughts(&self) -> bool {
        self.thinking_config
            .as_ref()
            .is_some_and(|config| config.include_thoughts)
    }

    pub fn last_message_text(&self) -> String {
        self.contents
            .last()
            .map(|content| content.text())
            .unwrap_or_default()
    }
}
