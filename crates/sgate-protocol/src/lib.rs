//! Wire types for the public, Gemini-protocol-compatible surface this gateway
//! exposes, plus the incremental byte-stream parsing helper shared by
//! streaming responses.

pub mod gemini;
pub mod sse;

pub use gemini::*;
