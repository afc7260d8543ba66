//! Property-based test generators using proptest.

use docsync_store::Document;
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for generating valid document IDs.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,23}").expect("Invalid regex")
}

/// Strategy for generating scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        prop::string::string_regex("[ -~]{0,32}")
            .expect("Invalid regex")
            .prop_map(Value::from),
        Just(Value::Null),
    ]
}

/// Strategy for generating document bodies with up to eight fields.
pub fn body_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,10}").expect("Invalid regex"),
        scalar_strategy(),
        0..8,
    )
    .prop_map(|fields| fields.into_iter().collect())
}

/// Strategy for generating new (unsaved) documents.
pub fn document_strategy() -> impl Strategy<Value = Document> {
    (doc_id_strategy(), body_strategy()).prop_map(|(id, body)| Document::with_properties(id, body))
}

/// Strategy for generating a set of documents with distinct IDs.
pub fn documents_strategy(max: usize) -> impl Strategy<Value = Vec<Document>> {
    prop::collection::btree_map(doc_id_strategy(), body_strategy(), 0..max).prop_map(|docs| {
        docs.into_iter()
            .map(|(id, body)| Document::with_properties(id, body))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_store::Database;

    proptest! {
        #[test]
        fn generated_documents_save(docs in documents_strategy(16)) {
            let db = Database::open_in_memory("gen").unwrap();
            for doc in &docs {
                db.save(doc).unwrap();
            }
            prop_assert_eq!(db.document_count(), docs.len());
        }
    }
}
