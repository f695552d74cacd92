pub mod cache;
pub mod chunk;
pub mod client;
pub mod error;
pub mod parser;
pub mod token;

pub use cache::{ClientFactory, UpstreamClientCache, WreqClientFactory};
pub use chunk::{ParsedObject, TextChunk, is_normal_stop, parse_object};
pub use client::{
    GeneratedMedia, ProviderCredential, StreamAssistOutcome, StreamAssistParams, UpstreamClient,
    UpstreamClientConfig, WreqServerTokenSource, WreqUpstreamClient,
};
pub use error::UpstreamError;
pub use parser::StreamObjectParser;
pub use token::{ServerToken, ServerTokenSource, TokenLifecycle};
