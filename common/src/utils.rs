use std::time::Duration;

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        format!("{}m {}s", mins, secs)
    } else if secs == 0 && duration.subsec_millis() > 0 {
        format!("{}ms", duration.subsec_millis())
    } else {
        format!("{}s", secs)
    }
}

pub fn validate_url(url: &str) -> Result<(), String> {
    const SCHEMES: [&str; 6] = ["http://", "https://", "rtsp://", "rtsps://", "rtmp://", "file://"];

    if SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        Ok(())
    } else {
        Err("URL must start with http://, https://, rtsp://, rtsps://, rtmp:// or file://".to_string())
    }
}

/// Parses durations such as `500ms`, `90s`, `1m`, `1h30m` or a bare number of
/// seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration '{}': expected a number", input));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid duration '{}'", input))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let secs = match unit {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            "" => return Err(format!("invalid duration '{}': missing unit", input)),
            other => {
                return Err(format!(
                    "invalid duration '{}': unknown unit '{}'",
                    input, other
                ))
            }
        };
        let part = Duration::try_from_secs_f64(secs)
            .map_err(|_| format!("invalid duration '{}': out of range", input))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("invalid duration '{}': out of range", input))?;
    }

    Ok(total)
}

/// Serde adapter for `Duration` fields written as `"1m"`, `"500ms"` or plain
/// seconds. Use with `#[serde(with = "lookout_common::utils::duration")]`.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", value.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", value.as_millis()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1m0s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration(" 45 ").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_ok());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("1.5").is_err());
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        assert!(parse_duration("100000000000000000000h").is_err());
        assert!(parse_duration("18000000000000000000s18000000000000000000s").is_err());
    }

    #[test]
    fn test_duration_serde_accepts_numbers_and_text() {
        #[derive(serde::Deserialize, serde::Serialize)]
        struct Holder {
            #[serde(with = "duration")]
            interval: Duration,
        }

        let h: Holder = serde_json::from_str(r#"{"interval": "2m"}"#).unwrap();
        assert_eq!(h.interval, Duration::from_secs(120));

        let h: Holder = serde_json::from_str(r#"{"interval": 15}"#).unwrap();
        assert_eq!(h.interval, Duration::from_secs(15));

        let out = serde_json::to_string(&Holder { interval: Duration::from_millis(250) }).unwrap();
        assert_eq!(out, r#"{"interval":"250ms"}"#);
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("rtsp://10.0.0.5/stream1").is_ok());
        assert!(validate_url("http://cam.local/video.mjpg").is_ok());
        assert!(validate_url("ftp://cam.local").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m 0s");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
    }
}
