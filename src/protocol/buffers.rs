use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serialize binary buffers as a list of base64 strings.
pub fn serialize<S>(buffers: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    buffers
        .iter()
        .map(|bytes| STANDARD.encode(bytes))
        .collect::<Vec<_>>()
        .serialize(serializer)
}

/// Decode a list of base64 strings. `null` decodes to no buffers.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<Vec<String>> = Option::deserialize(deserializer)?;
    encoded
        .unwrap_or_default()
        .iter()
        .map(|value| STANDARD.decode(value).map_err(serde::de::Error::custom))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Carrier {
        #[serde(default, with = "crate::protocol::buffers")]
        buffers: Vec<Vec<u8>>,
    }

    #[test]
    fn encodes_as_base64_strings() {
        let carrier = Carrier {
            buffers: vec![vec![0, 1, 2], b"hi".to_vec()],
        };
        let value = serde_json::to_value(&carrier).unwrap();
        assert_eq!(value, json!({"buffers": ["AAEC", "aGk="]}));
    }

    #[test]
    fn null_and_missing_decode_to_empty() {
        let from_null: Carrier = serde_json::from_value(json!({"buffers": null})).unwrap();
        let from_missing: Carrier = serde_json::from_value(json!({})).unwrap();
        assert!(from_null.buffers.is_empty());
        assert!(from_missing.buffers.is_empty());
    }

    #[test]
    fn rejects_invalid_base64() {
        let result: Result<Carrier, _> = serde_json::from_value(json!({"buffers": ["***"]}));
        assert!(result.is_err());
    }
}
