//! Encodes/decodes Documents to/from the JSON-compatible byte form the
//! BTree Layer stores, enforcing the 8 KiB size ceiling.

use tether_core::document::{Document, MAX_ENCODED_SIZE};
use tether_core::error::{Error, Result};

/// Encodes `document` to its textual form, rejecting it if the
/// encoding exceeds the size ceiling.
pub fn encode(document: &Document) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(document)?;
    if bytes.len() > MAX_ENCODED_SIZE {
        return Err(Error::TooLarge {
            size: bytes.len(),
            limit: MAX_ENCODED_SIZE,
        });
    }
    Ok(bytes)
}

/// Decodes a previously encoded Document. A backing record that
/// doesn't parse as a JSON object indicates on-storage corruption.
pub fn decode(bytes: &[u8]) -> Result<Document> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| Error::Corrupt("stored record is not a JSON object".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_a_small_document() {
        let document = json!({"name": "John", "age": 30})
            .as_object()
            .unwrap()
            .clone();
        let bytes = encode(&document).unwrap();
        assert_eq!(decode(&bytes).unwrap(), document);
    }

    #[test]
    fn rejects_documents_over_the_size_ceiling() {
        let mut document = serde_json::Map::new();
        document.insert("blob".to_string(), json!("x".repeat(MAX_ENCODED_SIZE)));
        let err = encode(&document).unwrap_err();
        assert!(matches!(err, Error::TooLarge { .. }));
    }

    #[test]
    fn decode_rejects_a_non_object_json_value() {
        let bytes = serde_json::to_vec(&json!([1, 2, 3])).unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
