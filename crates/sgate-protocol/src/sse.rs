//! Server-sent-event framing for the public streaming endpoint.
//!
//! The upstream's own streaming framing is a different, non-SSE format (see
//! `sgate-upstream`'s incremental JSON-array parser); this module only concerns
//! the outbound side, where every response chunk is re-framed as SSE for the
//! public API caller.

pub const DONE_LINE: &str = "data: [DONE]\n\n";

/// Frame one JSON-encoded chunk as an SSE `data:` line.
pub fn data_line(json: &str) -> String {
    format!("data: {json}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_a_single_line() {
        assert_eq!(data_line("{\"a\":1}"), "data: {\"a\":1}\n\n");
    }
}
