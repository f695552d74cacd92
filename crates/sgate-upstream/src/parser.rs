//! Incremental parser for the upstream's concatenated-JSON streaming
//! framing: `[ obj , obj , obj ]` where whitespace between objects may be any
//! mix of commas, newlines and spaces, and a chunk boundary may land
//! anywhere, including mid-string or mid-object.
//!
//! This is not SSE. There is no guarantee a chunk boundary aligns with an
//! object boundary, so the parser is a small byte-at-a-time state machine
//! rather than a line reader.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    Inside,
    InString,
    EscapeNext,
}

/// Feed bytes in as they arrive; each time a complete top-level object is
/// seen, the raw bytes of that object are handed to the caller.
pub struct StreamObjectParser {
    state: State,
    depth: u32,
    buf: Vec<u8>,
    array_opened: bool,
    array_closed: bool,
}

impl Default for StreamObjectParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamObjectParser {
    pub fn new() -> Self {
        Self {
            state: State::Outside,
            depth: 0,
            buf: Vec::new(),
            array_opened: false,
            array_closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.array_closed
    }

    /// Feeds one chunk. `on_object` is invoked once per completed object, in
    /// arrival order, with that object's raw bytes.
    pub fn feed(&mut self, chunk: &[u8], mut on_object: impl FnMut(Vec<u8>)) {
        for &byte in chunk {
            if self.array_closed {
                break;
            }
            match self.state {
                State::Outside => match byte {
                    b'[' if !self.array_opened => self.array_opened = true,
                    b']' => self.array_closed = true,
                    b',' | b'\r' | b'\n' | b' ' | b'\t' => {}
                    b'{' => {
                        self.state = State::Inside;
                        self.depth = 1;
                        self.buf.clear();
                        self.buf.push(byte);
                    }
                    _ => {}
                },
                State::Inside => {
                    self.buf.push(byte);
                    match byte {
                        b'"' => self.state = State::InString,
                        b'{' => self.depth += 1,
                        b'}' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                let object = std::mem::take(&mut self.buf);
                                self.state = State::Outside;
                                on_object(object);
                            }
                        }
                        _ => {}
                    }
                }
                State::InString => {
                    self.buf.push(byte);
                    match byte {
                        b'\\' => self.state = State::EscapeNext,
                        b'"' => self.state = State::Inside,
                        _ => {}
                    }
                }
                State::EscapeNext => {
                    self.buf.push(byte);
                    self.state = State::InString;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&[u8]]) -> Vec<String> {
        let mut parser = StreamObjectParser::new();
        let mut objects = Vec::new();
        for chunk in chunks {
            parser.feed(chunk, |bytes| objects.push(String::from_utf8(bytes).unwrap()));
        }
        objects
    }

    #[test]
    fn parses_whole_buffer_at_once() {
        let input = br#"[{"a":1}, {"b":2}]"#;
        let objects = collect(&[input]);
        assert_eq!(objects, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn adversarial_byte_at_a_time_chunking() {
        let input = b"[{\"a\":\"x},{\"} ,  \r\n {\"b\":2}]";
        let chunks: Vec<&[u8]> = input.iter().map(std::slice::from_ref).collect();
        let objects = collect(&chunks);
        assert_eq!(objects, vec!["{\"a\":\"x},{\"}", "{\"b\":2}"]);
    }

    #[test]
    fn brace_inside_string_does_not_close_object() {
        let objects = collect(&[br#"[{"text":"a}b{c"}]"#]);
        assert_eq!(objects, vec![r#"{"text":"a}b{c"}"#]);
    }

    #[test]
    fn escaped_quote_does_not_exit_string() {
        let objects = collect(&[br#"[{"text":"a\"}\"b"}]"#]);
        assert_eq!(objects, vec![r#"{"text":"a\"}\"b"}"#]);
    }

    #[test]
    fn array_close_stops_further_parsing() {
        let mut parser = StreamObjectParser::new();
        let mut objects = Vec::new();
        parser.feed(br#"[{"a":1}]"#, |bytes| objects.push(bytes));
        assert!(parser.is_closed());
        parser.feed(b"garbage", |bytes| objects.push(bytes));
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn nested_object_only_closes_at_depth_zero() {
        let objects = collect(&[br#"[{"a":{"b":1}}]"#]);
        assert_eq!(objects, vec![r#"{"a":{"b":1}}"#]);
    }
}
