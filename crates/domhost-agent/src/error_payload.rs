pub const PREFIX: &str = "DOMHOST_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

pub const INVALID_PARAM: &str = "invalid_param";
pub const UNKNOWN_GAME: &str = "unknown_game";
pub const PORT_BUSY: &str = "port_busy";
pub const KILL_FAILED: &str = "kill_failed";
pub const LAUNCH_FAILED: &str = "launch_failed";
pub const INTERNAL: &str = "internal";

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn encode(code: &str, message: impl Into<String>, hint: Option<String>) -> String {
    let payload = ErrorPayload {
        code: code.to_string(),
        message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
    };

    let json = serde_json::to_string(&payload)
        .unwrap_or_else(|_| "{\"code\":\"internal\",\"message\":\"serialize_failed\"}".to_string());

    format!("{PREFIX}{json}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_truncates_message() {
        let long = "a".repeat(MAX_MESSAGE_BYTES + 1024);
        let s = encode(INTERNAL, long, None);
        assert!(s.starts_with(PREFIX));

        let v: serde_json::Value = serde_json::from_str(&s[PREFIX.len()..]).unwrap();
        let msg = v.get("message").unwrap().as_str().unwrap();
        assert!(msg.len() <= MAX_MESSAGE_BYTES);
        assert!(msg.ends_with("…(truncated)"));
        assert!(v.get("hint").is_none());
    }

    #[test]
    fn encode_keeps_code_and_hint() {
        let s = encode(KILL_FAILED, "still alive", Some("retry later".to_string()));
        let v: serde_json::Value = serde_json::from_str(&s[PREFIX.len()..]).unwrap();
        assert_eq!(v["code"], "kill_failed");
        assert_eq!(v["hint"], "retry later");
    }
}
