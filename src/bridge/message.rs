//! Text frames sent by the browser terminal.
//!
//! ```json
//! {"resize": [cols, rows]}
//! {"data": "ls -l\r"}
//! ```
//!
//! The terminal sends its size width first, as xterm.js reports it.
//! [`PeerMessage::resize`] holds it the other way round, `(rows, cols)`, to
//! match [`Session::resize`](super::session::Session::resize).
//!
//! Both keys may appear in one frame. Anything that does not match is
//! dropped without an error reply: malformed JSON, non-objects, a `resize`
//! that is not two positive integers, a `data` that is not a non-empty string.

use serde_json::Value;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    /// `(rows, cols)`.
    pub resize: Option<(u16, u16)>,
    pub data: Option<String>,
}

impl PeerMessage {
    pub fn parse(text: &str) -> Self {
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) else {
            return Self::default();
        };
        Self {
            resize: map.get("resize").and_then(parse_size),
            data: map
                .get("data")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resize.is_none() && self.data.is_none()
    }
}

fn parse_size(value: &Value) -> Option<(u16, u16)> {
    let [cols, rows] = value.as_array()?.as_slice() else {
        return None;
    };
    let dim = |v: &Value| {
        v.as_u64()
            .filter(|&n| n > 0)
            .and_then(|n| u16::try_from(n).ok())
    };
    Some((dim(rows)?, dim(cols)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_is_cols_then_rows() {
        let msg = PeerMessage::parse(r#"{"resize": [80, 24]}"#);
        assert_eq!(msg.resize, Some((24, 80)));
        assert!(msg.data.is_none());
    }

    #[test]
    fn test_data() {
        let msg = PeerMessage::parse(r#"{"data": "ls\r"}"#);
        assert_eq!(msg.data.as_deref(), Some("ls\r"));
        assert!(msg.resize.is_none());
    }

    #[test]
    fn test_both_keys() {
        let msg = PeerMessage::parse(r#"{"resize": [200, 50], "data": "x"}"#);
        assert_eq!(msg.resize, Some((50, 200)));
        assert_eq!(msg.data.as_deref(), Some("x"));
    }

    #[test]
    fn test_ignored_shapes() {
        for text in [
            r#"{"resize": "bad"}"#,
            r#"{"resize": [80]}"#,
            r#"{"resize": [80, 24, 1]}"#,
            r#"{"resize": [0, 24]}"#,
            r#"{"resize": [80, -1]}"#,
            r#"{"resize": [80.5, 24]}"#,
            r#"{"resize": [70000, 24]}"#,
            r#"{"data": 123}"#,
            r#"{"data": ""}"#,
            r#"{"data": null}"#,
            r#"["data", "x"]"#,
            r#""data""#,
            "not json",
            "",
        ] {
            assert!(PeerMessage::parse(text).is_empty(), "{text}");
        }
    }
}
