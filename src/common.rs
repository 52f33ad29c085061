//! Shared serde helpers.

/// Serde support for `std::time::Duration` config fields.
///
/// Serializes to a human-friendly suffixed string ("30s", "500ms") and
/// accepts either that form or the `{ "secs": u64, "nanos": u32 }` object
/// form on input.
pub mod duration_serde {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => parse(&s).map_err(Error::custom),
            serde_json::Value::Number(n) => {
                // Bare numbers are seconds.
                let secs = n
                    .as_u64()
                    .ok_or_else(|| Error::custom("duration seconds must be a positive integer"))?;
                Ok(Duration::from_secs(secs))
            }
            serde_json::Value::Object(obj) => {
                let secs = obj
                    .get("secs")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| Error::custom("missing 'secs' field"))?;
                let nanos = obj.get("nanos").and_then(|v| v.as_u64()).unwrap_or(0);
                Ok(Duration::new(secs, nanos as u32))
            }
            _ => Err(Error::custom("invalid duration format")),
        }
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }
        if let Some(stripped) = s.strip_suffix("ms") {
            let n: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_millis(n));
        }
        if let Some(stripped) = s.strip_suffix('m') {
            let n: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_secs(n * 60));
        }
        if let Some(stripped) = s.strip_suffix('h') {
            let n: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_secs(n * 3600));
        }
        if let Some(stripped) = s.strip_suffix('s') {
            let n: f64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            let secs = n.trunc() as u64;
            let nanos = ((n.fract() * 1_000_000_000.0).round()) as u32;
            return Ok(Duration::new(secs, nanos));
        }
        Err(format!("unknown duration unit: {s}"))
    }

}
