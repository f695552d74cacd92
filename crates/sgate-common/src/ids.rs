/// A fresh v7 UUID (time-ordered) used as a request trace id.
pub fn new_trace_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
