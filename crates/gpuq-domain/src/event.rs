use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ── Event variants ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Allocated,
    SessionReady,
}

/// Worker lifecycle phases, in the order a well-behaved worker reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Created,
    Initializing,
    Loading,
    Ready,
    CleaningUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for FinishStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FinishStatus::Completed => "completed",
            FinishStatus::Failed => "failed",
            FinishStatus::Timeout => "timeout",
            FinishStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One event on a submission's stream. Serialized as one SSE frame per event:
/// a tag line, a JSON data line, then a blank line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    Connection {
        status: ConnectionStatus,
        gpu_id: Option<u32>,
        session_id: Option<String>,
    },
    Worker {
        status: WorkerPhase,
        container_id: Option<String>,
        message: Option<String>,
        error: Option<String>,
    },
    TextDelta {
        delta: String,
    },
    Text {
        content: String,
    },
    Logs {
        log: String,
        level: String,
        timestamp: Option<String>,
    },
    TaskFinish {
        status: FinishStatus,
        elapsed_seconds: Option<i64>,
        error: Option<String>,
    },
}

impl StreamEvent {
    pub fn connection(status: ConnectionStatus, gpu_id: Option<u32>, session_id: Option<String>) -> Self {
        StreamEvent::Connection { status, gpu_id, session_id }
    }

    pub fn worker(status: WorkerPhase, container_id: Option<String>) -> Self {
        StreamEvent::Worker { status, container_id, message: None, error: None }
    }

    pub fn text_delta(delta: impl Into<String>) -> Self {
        StreamEvent::TextDelta { delta: delta.into() }
    }

    pub fn text(content: impl Into<String>) -> Self {
        StreamEvent::Text { content: content.into() }
    }

    pub fn logs(log: impl Into<String>) -> Self {
        StreamEvent::Logs { log: log.into(), level: "info".to_string(), timestamp: None }
    }

    pub fn task_finish(status: FinishStatus, elapsed_seconds: Option<i64>, error: Option<String>) -> Self {
        StreamEvent::TaskFinish { status, elapsed_seconds, error }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            StreamEvent::Connection { .. } => "connection",
            StreamEvent::Worker { .. } => "worker",
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::Text { .. } => "text",
            StreamEvent::Logs { .. } => "logs",
            StreamEvent::TaskFinish { .. } => "task_finish",
        }
    }

    /// The data half of the wire frame. Optional fields are omitted, not null.
    pub fn payload(&self) -> Value {
        fn put_opt(obj: &mut serde_json::Map<String, Value>, key: &str, v: &Option<impl Serialize>) {
            if let Some(v) = v {
                obj.insert(key.to_string(), json!(v));
            }
        }

        match self {
            StreamEvent::Connection { status, gpu_id, session_id } => {
                let mut obj = serde_json::Map::new();
                obj.insert("status".into(), json!(status));
                put_opt(&mut obj, "gpu_id", gpu_id);
                put_opt(&mut obj, "session_id", session_id);
                Value::Object(obj)
            }
            StreamEvent::Worker { status, container_id, message, error } => {
                let mut obj = serde_json::Map::new();
                obj.insert("status".into(), json!(status));
                put_opt(&mut obj, "container_id", container_id);
                put_opt(&mut obj, "message", message);
                put_opt(&mut obj, "error", error);
                Value::Object(obj)
            }
            StreamEvent::TextDelta { delta } => json!({ "delta": delta }),
            StreamEvent::Text { content } => json!({ "content": content }),
            StreamEvent::Logs { log, level, timestamp } => {
                let mut obj = serde_json::Map::new();
                obj.insert("log".into(), json!(log));
                obj.insert("level".into(), json!(level));
                put_opt(&mut obj, "timestamp", timestamp);
                Value::Object(obj)
            }
            StreamEvent::TaskFinish { status, elapsed_seconds, error } => {
                let mut obj = serde_json::Map::new();
                obj.insert("status".into(), json!(status));
                put_opt(&mut obj, "elapsed_seconds", elapsed_seconds);
                put_opt(&mut obj, "error", error);
                Value::Object(obj)
            }
        }
    }

    /// SSE wire frame: `event: <tag>\ndata: <json>\n\n`.
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.tag(), self.payload())
    }
}

// ── Log-line parser ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ConnectionPayload {
    status: ConnectionStatus,
    #[serde(default)]
    gpu_id: Option<u32>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct WorkerPayload {
    status: WorkerPhase,
    #[serde(default)]
    container_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct TextDeltaPayload {
    delta: String,
}

#[derive(Deserialize)]
struct TextPayload {
    content: String,
}

#[derive(Deserialize)]
struct LogsPayload {
    log: String,
    #[serde(default = "default_level")]
    level: String,
    #[serde(default)]
    timestamp: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Deserialize)]
struct TaskFinishPayload {
    status: FinishStatus,
    #[serde(default)]
    elapsed_seconds: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse one container log line into a stream event.
///
/// A JSON object carrying a `type` (or `event`) key that names a known variant
/// becomes that event; its payload is the `data` sub-object when present,
/// otherwise the object's remaining fields. Everything else — plain text,
/// malformed JSON, unknown tags, payloads that don't fit the variant — is
/// preserved verbatim as a `logs` event so no worker output is lost. Empty
/// lines yield None.
pub fn parse_log_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) {
        let tag = obj
            .get("type")
            .or_else(|| obj.get("event"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if let Some(tag) = tag {
            let payload = match obj.get("data") {
                Some(Value::Object(data)) => Value::Object(data.clone()),
                _ => {
                    let mut rest = obj.clone();
                    rest.remove("type");
                    rest.remove("event");
                    Value::Object(rest)
                }
            };

            if let Some(event) = decode_payload(&tag, payload) {
                return Some(event);
            }
        }
    }

    Some(StreamEvent::logs(line))
}

fn decode_payload(tag: &str, payload: Value) -> Option<StreamEvent> {
    match tag {
        "connection" => serde_json::from_value::<ConnectionPayload>(payload)
            .ok()
            .map(|p| StreamEvent::Connection {
                status: p.status,
                gpu_id: p.gpu_id,
                session_id: p.session_id,
            }),
        "worker" => serde_json::from_value::<WorkerPayload>(payload)
            .ok()
            .map(|p| StreamEvent::Worker {
                status: p.status,
                container_id: p.container_id,
                message: p.message,
                error: p.error,
            }),
        "text_delta" => serde_json::from_value::<TextDeltaPayload>(payload)
            .ok()
            .map(|p| StreamEvent::TextDelta { delta: p.delta }),
        "text" => serde_json::from_value::<TextPayload>(payload)
            .ok()
            .map(|p| StreamEvent::Text { content: p.content }),
        "logs" => serde_json::from_value::<LogsPayload>(payload)
            .ok()
            .map(|p| StreamEvent::Logs { log: p.log, level: p.level, timestamp: p.timestamp }),
        "task_finish" => serde_json::from_value::<TaskFinishPayload>(payload)
            .ok()
            .map(|p| StreamEvent::TaskFinish {
                status: p.status,
                elapsed_seconds: p.elapsed_seconds,
                error: p.error,
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lines_are_dropped() {
        assert_eq!(parse_log_line(""), None);
        assert_eq!(parse_log_line("   \t  "), None);
    }

    #[test]
    fn plain_text_becomes_logs() {
        let ev = parse_log_line("loading checkpoint shard 3/4").unwrap();
        assert_eq!(
            ev,
            StreamEvent::Logs {
                log: "loading checkpoint shard 3/4".into(),
                level: "info".into(),
                timestamp: None,
            }
        );
    }

    #[test]
    fn malformed_json_becomes_logs() {
        let ev = parse_log_line("{not json").unwrap();
        assert_eq!(ev.tag(), "logs");
    }

    #[test]
    fn unknown_tag_becomes_logs() {
        let ev = parse_log_line(r#"{"type": "heartbeat", "n": 1}"#).unwrap();
        assert_eq!(ev.tag(), "logs");
    }

    #[test]
    fn inline_fields_parse_without_data_wrapper() {
        // Workers emit {"event": "worker", "status": ..., ...} with inline fields.
        let ev = parse_log_line(r#"{"event": "worker", "status": "loading", "message": "Loading model"}"#)
            .unwrap();
        assert_eq!(
            ev,
            StreamEvent::Worker {
                status: WorkerPhase::Loading,
                container_id: None,
                message: Some("Loading model".into()),
                error: None,
            }
        );
    }

    #[test]
    fn data_wrapper_takes_precedence() {
        let ev = parse_log_line(r#"{"type": "text_delta", "data": {"delta": "abc"}}"#).unwrap();
        assert_eq!(ev, StreamEvent::TextDelta { delta: "abc".into() });
    }

    #[test]
    fn bad_payload_for_known_tag_falls_back_to_logs() {
        // "worker" with an out-of-vocabulary status must not be dropped.
        let line = r#"{"type": "worker", "status": "meditating"}"#;
        let ev = parse_log_line(line).unwrap();
        assert_eq!(ev, StreamEvent::logs(line));
    }

    #[test]
    fn every_variant_round_trips_through_the_wire() {
        let events = vec![
            StreamEvent::connection(ConnectionStatus::Allocated, Some(0), None),
            StreamEvent::connection(ConnectionStatus::SessionReady, Some(1), Some("s-1".into())),
            StreamEvent::worker(WorkerPhase::Created, Some("cafebabe".into())),
            StreamEvent::text_delta("Loading progress: 20%\n"),
            StreamEvent::text("done!"),
            StreamEvent::Logs { log: "raw".into(), level: "warn".into(), timestamp: Some("t0".into()) },
            StreamEvent::task_finish(FinishStatus::Completed, Some(12), None),
            StreamEvent::task_finish(FinishStatus::Timeout, Some(61), Some("Task timeout exceeded".into())),
        ];

        for ev in events {
            // A worker emitting the tagged payload as one log line must round-trip.
            let mut line = serde_json::Map::new();
            line.insert("type".into(), serde_json::json!(ev.tag()));
            line.insert("data".into(), ev.payload());
            let line = Value::Object(line).to_string();
            let back = parse_log_line(&line).unwrap();
            assert_eq!(back, ev, "round-trip failed for {}", ev.tag());
        }
    }

    #[test]
    fn frame_format_is_tag_data_blank() {
        let ev = StreamEvent::text_delta("hi");
        let frame = ev.to_frame();
        assert!(frame.starts_with("event: text_delta\ndata: "));
        assert!(frame.ends_with("\n\n"));
        let data_line = frame.lines().nth(1).unwrap();
        let v: Value = serde_json::from_str(data_line.strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(v["delta"], "hi");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let ev = StreamEvent::connection(ConnectionStatus::Allocated, Some(0), None);
        let payload = ev.payload();
        assert_eq!(payload["gpu_id"], 0);
        assert!(payload.get("session_id").is_none());
    }
}
