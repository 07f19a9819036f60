//! The document data model: JSON-compatible values, dotted field paths,
//! and the reserved `_tags` convention.

use serde_json::Value;

/// A document: a JSON-serialisable map from string field names to values.
///
/// Fields may be scalars (string/number/bool/null), arrays, or nested
/// maps — exactly `serde_json`'s object model, which is already the
/// JSON-compatible textual encoding the Codec layer requires.
pub type Document = serde_json::Map<String, Value>;

/// Maximum size, in bytes, of a document after encoding.
pub const MAX_ENCODED_SIZE: usize = 8 * 1024;

/// Reserved field carrying caller-supplied tags.
pub const TAGS_FIELD: &str = "_tags";

/// Byte that begins every reserved B-tree key (TTL side entries). Chosen
/// to be invalid as the first byte of any UTF-8 string a caller could
/// type, so `FileBacking`/`MemoryBacking` can multiplex the TTL
/// namespace into the same ordered key space as regular records without
/// colliding with user keys.
pub const RESERVED_KEY_PREFIX: u8 = 0xFF;

/// Returns `true` if `key`, as raw bytes, would collide with the
/// reserved TTL side-entry namespace.
#[must_use]
pub fn is_reserved_key(key: &[u8]) -> bool {
    key.first() == Some(&RESERVED_KEY_PREFIX)
}

/// Inserts `tags` into the document's `_tags` field, creating it if absent.
///
/// Callers may pass tags alongside a document; the engine stores them
/// as a normal array field under the reserved name.
pub fn set_tags(document: &mut Document, tags: &[String]) {
    let array = tags.iter().cloned().map(Value::String).collect();
    document.insert(TAGS_FIELD.to_string(), Value::Array(array));
}

/// Looks up a dotted field path (`a.b.c`) within a document, returning
/// the value at that path if every segment resolves to a present,
/// object-typed (for non-terminal segments) field.
#[must_use]
pub fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = document.get(first)?;

    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }

    Some(current)
}
