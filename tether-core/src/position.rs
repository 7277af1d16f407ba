//! Dense ordering keys.
//!
//! The remote orders siblings by a positive floating point key. Callers may
//! also ask for "top" or "bottom" and let the service pick a concrete value.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Position {
    Top,
    Bottom,
    Fixed(f64),
}

impl Position {
    /// Fixed positions must be finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        match self {
            Position::Fixed(value) => value.is_finite() && *value > 0.0,
            Position::Top | Position::Bottom => true,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Position::Fixed(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Top => f.write_str("top"),
            Position::Bottom => f.write_str("bottom"),
            Position::Fixed(value) => write!(f, "{value}"),
        }
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Position::Top => serializer.serialize_str("top"),
            Position::Bottom => serializer.serialize_str("bottom"),
            Position::Fixed(value) => serializer.serialize_f64(*value),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WirePosition {
    Named(String),
    Number(f64),
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match WirePosition::deserialize(deserializer)? {
            WirePosition::Number(value) => Ok(Position::Fixed(value)),
            WirePosition::Named(name) => match name.as_str() {
                "top" => Ok(Position::Top),
                "bottom" => Ok(Position::Bottom),
                other => other
                    .parse::<f64>()
                    .map(Position::Fixed)
                    .map_err(|_| serde::de::Error::custom(format!("invalid position: {other}"))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_forms() {
        assert_eq!(serde_json::to_value(Position::Top).unwrap(), json!("top"));
        assert_eq!(serde_json::to_value(Position::Bottom).unwrap(), json!("bottom"));
        assert_eq!(serde_json::to_value(Position::Fixed(16384.0)).unwrap(), json!(16384.0));

        let parsed: Position = serde_json::from_value(json!(65535)).unwrap();
        assert_eq!(parsed, Position::Fixed(65535.0));
        let parsed: Position = serde_json::from_value(json!("bottom")).unwrap();
        assert_eq!(parsed, Position::Bottom);
        let parsed: Position = serde_json::from_value(json!("12.5")).unwrap();
        assert_eq!(parsed, Position::Fixed(12.5));
        assert!(serde_json::from_value::<Position>(json!("middle")).is_err());
    }

    #[test]
    fn test_validity() {
        assert!(Position::Top.is_valid());
        assert!(Position::Fixed(0.5).is_valid());
        assert!(!Position::Fixed(0.0).is_valid());
        assert!(!Position::Fixed(-3.0).is_valid());
        assert!(!Position::Fixed(f64::NAN).is_valid());
    }
}
