use std::collections::{HashMap, HashSet};
use std::path::Path;

use metrics::counter;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::FileError;
use crate::metrics_consts::{RECORDS_ACCEPTED, RECORDS_REJECTED};
use crate::types::{ParsedSubmission, SubmissionRecord, TableKind};

/// Curated map of tree name to git repository URL, loaded from the optional
/// `--trees-file`. Advisory only: checkouts naming an unlisted tree warn but
/// are still ingested.
#[derive(Debug, Default, Clone)]
pub struct KnownTrees(HashMap<String, String>);

impl KnownTrees {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self(serde_json::from_str(&raw)?))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_known(&self, tree_name: &str) -> bool {
        self.0.contains_key(tree_name)
    }
}

/// Parse one raw submission document into typed per-table record batches.
///
/// Only two conditions fail the whole file: the document is not valid JSON,
/// or its top level is not an object. Everything below that is per-item:
/// malformed members are logged, counted as rejected and skipped while the
/// rest of the file keeps going.
pub fn parse_submission(raw: &[u8], trees: &KnownTrees) -> Result<ParsedSubmission, FileError> {
    let doc: Value = serde_json::from_slice(raw)?;
    let Value::Object(doc) = doc else {
        return Err(FileError::NotAnObject);
    };

    let mut parsed = ParsedSubmission::default();
    for kind in TableKind::ALL {
        match kind {
            TableKind::Issue => parse_section(&doc, &mut parsed.issues, &mut parsed.rejected),
            TableKind::Checkout => parse_section(&doc, &mut parsed.checkouts, &mut parsed.rejected),
            TableKind::Build => parse_section(&doc, &mut parsed.builds, &mut parsed.rejected),
            TableKind::Test => parse_section(&doc, &mut parsed.tests, &mut parsed.rejected),
            TableKind::Incident => parse_section(&doc, &mut parsed.incidents, &mut parsed.rejected),
        }
    }

    if !trees.is_empty() {
        let mut warned = HashSet::new();
        for checkout in &parsed.checkouts {
            if let Some(tree) = checkout.tree_name.as_deref() {
                if !trees.is_known(tree) && warned.insert(tree.to_owned()) {
                    warn!("checkout {} names unlisted tree {}", checkout.id, tree);
                }
            }
        }
    }

    Ok(parsed)
}

fn parse_section<T: SubmissionRecord>(
    doc: &Map<String, Value>,
    out: &mut Vec<T>,
    rejected: &mut usize,
) {
    let section = T::KIND.section();
    let Some(value) = doc.get(section) else {
        return;
    };
    let Value::Array(items) = value else {
        warn!("section {} is not an array, skipping it", section);
        *rejected += 1;
        counter!(RECORDS_REJECTED, "table" => section).increment(1);
        return;
    };

    for item in items {
        let Value::Object(obj) = item else {
            warn!("skipping non-object {} member", section);
            *rejected += 1;
            counter!(RECORDS_REJECTED, "table" => section).increment(1);
            continue;
        };

        let mut obj = obj.clone();
        T::KIND.flatten(&mut obj);
        let item_id = obj
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<no id>")
            .to_owned();

        match serde_json::from_value::<T>(Value::Object(obj)) {
            Ok(record) => {
                // Acceptance into the batch is counted here, at construction,
                // even if the batch later fails to persist.
                let labels = record.metric_labels();
                counter!(RECORDS_ACCEPTED, &labels).increment(1);
                out.push(record);
            }
            Err(error) => {
                warn!("skipping {} item {}: {}", section, item_id, error);
                *rejected += 1;
                counter!(RECORDS_REJECTED, "table" => section).increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<ParsedSubmission, FileError> {
        parse_submission(raw.as_bytes(), &KnownTrees::default())
    }

    #[test]
    fn checkout_and_build_parse_in_dependency_order() {
        let parsed = parse(
            r#"{
                "checkouts": [{"id": "c1", "origin": "maestro", "tree_name": "mainline"}],
                "builds": [{"id": "b1", "checkout_id": "c1", "origin": "maestro", "status": "PASS"}]
            }"#,
        )
        .unwrap();

        assert_eq!(parsed.checkouts.len(), 1);
        assert_eq!(parsed.builds.len(), 1);
        assert_eq!(parsed.rejected, 0);
        assert_eq!(parsed.accepted(), 2);
    }

    #[test]
    fn top_level_array_is_a_fatal_shape_error() {
        assert!(matches!(parse("[1, 2]"), Err(FileError::NotAnObject)));
    }

    #[test]
    fn invalid_json_is_fatal() {
        assert!(matches!(parse("{nope"), Err(FileError::Json(_))));
    }

    #[test]
    fn unknown_extra_field_does_not_reject_the_item() {
        let parsed = parse(
            r#"{"builds": [{"id": "b1", "checkout_id": "c1", "origin": "maestro",
                "status": "PASS", "bogus_field": 1}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.builds.len(), 1);
        assert_eq!(parsed.rejected, 0);
    }

    #[test]
    fn malformed_member_is_skipped_not_fatal() {
        let parsed = parse(
            r#"{"tests": [
                42,
                {"id": "t1", "build_id": "b1", "origin": "maestro"},
                {"origin": "maestro"}
            ]}"#,
        )
        .unwrap();

        // The integer member and the id-less member are rejected; the
        // well-formed one still lands.
        assert_eq!(parsed.tests.len(), 1);
        assert_eq!(parsed.tests[0].id, "t1");
        assert_eq!(parsed.rejected, 2);
    }

    #[test]
    fn non_array_section_is_skipped() {
        let parsed = parse(
            r#"{"issues": {"id": "i1"},
                "checkouts": [{"id": "c1", "origin": "maestro"}]}"#,
        )
        .unwrap();
        assert!(parsed.issues.is_empty());
        assert_eq!(parsed.checkouts.len(), 1);
        assert_eq!(parsed.rejected, 1);
    }

    #[test]
    fn accepted_never_exceeds_input_items() {
        let parsed = parse(
            r#"{"incidents": [
                {"id": "inc1", "origin": "maestro", "issue_id": "i1"},
                {"id": "inc2", "origin": "maestro", "issue_id": "i1", "present": true},
                null
            ]}"#,
        )
        .unwrap();
        assert!(parsed.incidents.len() <= 3);
        assert_eq!(parsed.incidents.len(), 2);
        assert_eq!(parsed.rejected, 1);
    }

    #[test]
    fn missing_sections_parse_to_empty() {
        let parsed = parse("{}").unwrap();
        assert!(parsed.is_empty());
        assert_eq!(parsed.rejected, 0);
    }
}
