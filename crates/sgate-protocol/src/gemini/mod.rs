pub mod models;
pub mod request;
pub mod response;

pub use models::{ModelDescriptor, ListModelsResponse};
pub use request::{Content, GenerateContentRequestBody, GenerationConfig, Modality, Role, ThinkingConfig};
pub use response::{
    Candidate, FinishReason, GenerateContentResponse, Part, SafetyCategory, SafetyRating,
    UsageMetadata,
};
