use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Deserializes a humantime string ("30s", "10m", "1h 30m") into any
/// duration-like type. A missing value yields `T::default()`.
pub fn deserialize_duration<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: From<Duration> + Default,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(text) => humantime::parse_duration(text.trim())
            .map(T::from)
            .map_err(serde::de::Error::custom),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(default, deserialize_with = "deserialize_duration")]
        timeout: Duration,
    }

    #[test]
    fn parses_humantime_strings() {
        let holder: Holder =
            serde_yaml::from_str("timeout: 1m 30s").unwrap();
        assert_eq!(holder.timeout, Duration::from_secs(90));
    }

    #[test]
    fn missing_value_uses_default() {
        let holder: Holder = serde_yaml::from_str("{}").unwrap();
        assert_eq!(holder.timeout, Duration::ZERO);
    }

    #[test]
    fn rejects_garbage() {
        assert!(
            serde_yaml::from_str::<Holder>("timeout: soonish").is_err()
        );
    }
}
