//! Document metadata merging.
//!
//! Documents carry a `{source, processing}` namespaced metadata
//! object. Older rows used a flat shape; those are migrated on read.
//! Processing writes must never clobber the `source` namespace — the
//! origin adapter's dedup compares `source.ingested_at` against the
//! origin's modified time.

use chrono::Utc;
use serde_json::{json, Map, Value};

/// Fields that belonged to the source namespace in the flat shape.
const SOURCE_FIELDS: [&str; 9] = [
    "google_drive_file_id",
    "original_name",
    "parents",
    "mime_type",
    "uploaded_by",
    "uploaded_at",
    "imported_by",
    "imported_at",
    "folder_context",
];

/// Merge processing results into existing document metadata,
/// returning the namespaced shape with `source` preserved and a
/// `processing.last_updated` stamp.
pub fn merge_document_metadata(
    existing: &Map<String, Value>,
    processing_results: Map<String, Value>,
) -> Map<String, Value> {
    let (mut source, mut processing) = split_namespaces(existing);

    for (key, value) in processing_results {
        processing.insert(key, value);
    }
    processing.insert(
        "last_updated".to_string(),
        json!(Utc::now().to_rfc3339()),
    );

    let mut merged = Map::new();
    merged.insert("source".to_string(), Value::Object(std::mem::take(&mut source)));
    merged.insert("processing".to_string(), Value::Object(processing));
    merged
}

/// Initial metadata for a new document: source data plus an empty
/// processing namespace.
pub fn initial_metadata(source_data: Map<String, Value>) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("source".to_string(), Value::Object(source_data));
    metadata.insert("processing".to_string(), Value::Object(Map::new()));
    metadata
}

/// Read `source.<key>` from metadata in either shape.
pub fn source_field<'a>(metadata: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(Value::Object(source)) = metadata.get("source") {
        return source.get(key);
    }
    // Legacy flat shape.
    metadata.get(key)
}

/// Split metadata into (source, processing) namespaces, migrating the
/// legacy flat shape by field name.
fn split_namespaces(metadata: &Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let has_namespaces = metadata.contains_key("source") || metadata.contains_key("processing");

    if has_namespaces {
        let source = as_object(metadata.get("source"));
        let processing = as_object(metadata.get("processing"));
        return (source, processing);
    }

    // Legacy flat shape: route known source fields, everything else is
    // processing data.
    let mut source = Map::new();
    let mut processing = Map::new();
    for (key, value) in metadata {
        if SOURCE_FIELDS.contains(&key.as_str()) {
            source.insert(key.clone(), value.clone());
        } else {
            processing.insert(key.clone(), value.clone());
        }
    }
    (source, processing)
}

fn as_object(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}
