pub mod fingerprint;
pub mod matcher;

pub use fingerprint::{Fingerprint, fingerprint};
pub use matcher::{MatchKind, MatchResult, SessionError, SessionMatcher};
