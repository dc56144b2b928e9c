//! Kubernetes-style duration strings (`"300s"`, `"10m"`, `"1h30m"`, `"1.5h"`)

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A non-negative duration that round-trips through the duration string
/// format used by Kubernetes APIs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    pub const fn as_std(&self) -> std::time::Duration {
        self.0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Self(d)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        d.0
    }
}

fn unit_nanos(unit: &str) -> Option<f64> {
    let nanos = match unit {
        "ns" => 1.0,
        "us" | "µs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60.0 * 1e9,
        "h" => 3600.0 * 1e9,
        _ => return None,
    };
    Some(nanos)
}

impl FromStr for Duration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input == "0" {
            return Ok(Self::default());
        }
        if input.is_empty() {
            return Err("empty duration".to_string());
        }
        if input.starts_with('-') {
            return Err(format!("negative duration {:?}", s));
        }

        let mut rest = input.strip_prefix('+').unwrap_or(input);
        let mut total_nanos = 0f64;

        while !rest.is_empty() {
            let number_len = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| format!("missing unit in duration {:?}", s))?;
            if number_len == 0 {
                return Err(format!("invalid duration {:?}", s));
            }
            let value: f64 = rest[..number_len]
                .parse()
                .map_err(|_| format!("invalid number in duration {:?}", s))?;
            rest = &rest[number_len..];

            let unit_len = rest
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(rest.len());
            let unit = &rest[..unit_len];
            let nanos = unit_nanos(unit)
                .ok_or_else(|| format!("unknown unit {:?} in duration {:?}", unit, s))?;
            rest = &rest[unit_len..];

            total_nanos += value * nanos;
        }

        Ok(Self(std::time::Duration::from_nanos(total_nanos.round() as u64)))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.as_secs();
        let subsec_millis = self.0.subsec_millis();
        if total == 0 && subsec_millis == 0 {
            return write!(f, "0s");
        }
        if total == 0 {
            return write!(f, "{}ms", subsec_millis);
        }

        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let seconds = total % 60;
        if hours > 0 {
            write!(f, "{}h", hours)?;
        }
        if hours > 0 || minutes > 0 {
            write!(f, "{}m", minutes)?;
        }
        if subsec_millis > 0 {
            write!(f, "{}.{:03}s", seconds, subsec_millis)
        } else {
            write!(f, "{}s", seconds)
        }
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for Duration {
    fn schema_name() -> String {
        "Duration".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}
