//! Lenient parsing of JSON-RPC quantities.
//!
//! Feeds encode numbers either as `0x`-prefixed hex strings or as plain JSON numbers
//! (flashblock metadata uses the latter). Both forms are accepted.

use serde::{Deserialize, Deserializer, de::Error as _};

/// Parses a quantity string. Hex requires a `0x` prefix, anything else is read as decimal.
/// `"0x"` is treated as zero.
pub fn parse_quantity(value: &str) -> Option<u64> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some("") => Some(0),
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Quantity {
    Number(u64),
    Text(String),
}

/// `deserialize_with` helper for optional quantities. Absent and `null` both map to `None`.
pub fn deserialize_quantity_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Quantity>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Quantity::Number(n)) => Ok(Some(n)),
        Some(Quantity::Text(s)) => parse_quantity(&s)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid quantity: {s}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(default, deserialize_with = "deserialize_quantity_opt")]
        value: Option<u64>,
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x5"), Some(5));
        assert_eq!(parse_quantity("0x64000000"), Some(0x6400_0000));
        assert_eq!(parse_quantity("0x"), Some(0));
        assert_eq!(parse_quantity("123"), Some(123));
        assert_eq!(parse_quantity("0xzz"), None);
        assert_eq!(parse_quantity("not a number"), None);
    }

    #[test]
    fn test_deserialize_number_and_hex() {
        let w: Wrapper = serde_json::from_str(r#"{"value": 42}"#).unwrap();
        assert_eq!(w.value, Some(42));

        let w: Wrapper = serde_json::from_str(r#"{"value": "0x2a"}"#).unwrap();
        assert_eq!(w.value, Some(42));

        let w: Wrapper = serde_json::from_str(r#"{"value": null}"#).unwrap();
        assert_eq!(w.value, None);

        let w: Wrapper = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(w.value, None);
    }

    #[test]
    fn test_deserialize_invalid_quantity() {
        let result = serde_json::from_str::<Wrapper>(r#"{"value": "0xnope"}"#);
        assert!(result.is_err());
    }
}
