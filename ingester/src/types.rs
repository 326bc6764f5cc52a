use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The five destination tables, in dependency order: incidents reference
/// builds/tests/issues, and builds/tests reference checkouts, so inserts
/// (and section parsing) always walk this array front to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Issue,
    Checkout,
    Build,
    Test,
    Incident,
}

impl TableKind {
    pub const ALL: [TableKind; 5] = [
        TableKind::Issue,
        TableKind::Checkout,
        TableKind::Build,
        TableKind::Test,
        TableKind::Incident,
    ];

    /// Top-level key of this table's section in a submission document.
    pub fn section(&self) -> &'static str {
        match self {
            TableKind::Issue => "issues",
            TableKind::Checkout => "checkouts",
            TableKind::Build => "builds",
            TableKind::Test => "tests",
            TableKind::Incident => "incidents",
        }
    }

    /// Merge one level of this table's known sub-objects into the item as
    /// `{parent}_{child}` keys, so sub-object fields reach the same field
    /// filter as top-level ones. Existing top-level keys win on collision.
    pub fn flatten(&self, item: &mut Map<String, Value>) {
        match self {
            TableKind::Build | TableKind::Issue => flatten_subobject(item, "culprit"),
            TableKind::Test => {
                flatten_subobject(item, "environment");
                flatten_subobject(item, "number");
            }
            TableKind::Checkout | TableKind::Incident => {}
        }
    }
}

fn flatten_subobject(item: &mut Map<String, Value>, parent: &str) {
    if !matches!(item.get(parent), Some(Value::Object(_))) {
        return;
    }
    let Some(Value::Object(sub)) = item.remove(parent) else {
        return;
    };
    for (key, value) in sub {
        item.entry(format!("{parent}_{key}")).or_insert(value);
    }
}

/// A file reference attached to a record, e.g. an uploaded log excerpt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub name: String,
    pub url: String,
}

/// A typed row bound for one of the destination tables. The struct's named
/// fields are the table's allow-list: deserialization drops unknown keys
/// instead of erroring, which is the field filter of the parse step.
pub trait SubmissionRecord: DeserializeOwned + Send + Sync + 'static {
    const KIND: TableKind;

    fn id(&self) -> &str;
    fn origin(&self) -> &str;

    /// Dimensions for the acceptance counters. Builds and tests add the
    /// lab/platform breakdown on top of (table, origin).
    fn metric_labels(&self) -> Vec<(&'static str, String)> {
        vec![
            ("table", Self::KIND.section().to_owned()),
            ("origin", self.origin().to_owned()),
        ]
    }
}

/// Records carrying a log excerpt that the conversion step may replace with
/// an uploaded reference.
pub trait HasLogExcerpt {
    fn log_excerpt(&self) -> Option<&str>;
    /// Empty the excerpt field and point `output_files` at the reference.
    fn set_excerpt_reference(&mut self, url: String);
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Checkout {
    pub id: String,
    pub origin: String,
    pub tree_name: Option<String>,
    pub git_repository_url: Option<String>,
    pub git_commit_hash: Option<String>,
    pub git_commit_name: Option<String>,
    pub git_repository_branch: Option<String>,
    pub patchset_hash: Option<String>,
    pub message_id: Option<String>,
    pub comment: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub contacts: Option<Vec<String>>,
    pub log_url: Option<String>,
    pub log_excerpt: Option<String>,
    pub valid: Option<bool>,
    pub misc: Option<Value>,
    #[serde(skip_deserializing, default = "Utc::now")]
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Build {
    pub id: String,
    pub checkout_id: String,
    pub origin: String,
    pub comment: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub architecture: Option<String>,
    pub command: Option<String>,
    pub compiler: Option<String>,
    pub input_files: Option<Vec<OutputFile>>,
    pub output_files: Option<Vec<OutputFile>>,
    pub config_name: Option<String>,
    pub config_url: Option<String>,
    pub log_url: Option<String>,
    pub log_excerpt: Option<String>,
    pub valid: Option<bool>,
    pub status: Option<String>,
    pub culprit_code: Option<bool>,
    pub culprit_tool: Option<bool>,
    pub culprit_harness: Option<bool>,
    pub misc: Option<Value>,
    #[serde(skip_deserializing, default = "Utc::now")]
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Test {
    pub id: String,
    pub build_id: String,
    pub origin: String,
    pub path: Option<String>,
    pub comment: Option<String>,
    pub log_url: Option<String>,
    pub log_excerpt: Option<String>,
    pub status: Option<String>,
    pub waived: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub output_files: Option<Vec<OutputFile>>,
    pub environment_comment: Option<String>,
    pub environment_compatible: Option<Vec<String>>,
    pub environment_misc: Option<Value>,
    pub number_value: Option<f64>,
    pub number_unit: Option<String>,
    pub number_prefix: Option<String>,
    pub misc: Option<Value>,
    #[serde(skip_deserializing, default = "Utc::now")]
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Issue {
    pub id: String,
    pub origin: String,
    pub version: Option<i64>,
    pub report_url: Option<String>,
    pub report_subject: Option<String>,
    pub culprit_code: Option<bool>,
    pub culprit_tool: Option<bool>,
    pub culprit_harness: Option<bool>,
    pub build_valid: Option<bool>,
    pub test_status: Option<String>,
    pub comment: Option<String>,
    pub misc: Option<Value>,
    #[serde(skip_deserializing, default = "Utc::now")]
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Incident {
    pub id: String,
    pub origin: String,
    pub issue_id: String,
    pub issue_version: Option<i64>,
    pub build_id: Option<String>,
    pub test_id: Option<String>,
    pub present: Option<bool>,
    pub comment: Option<String>,
    pub misc: Option<Value>,
    #[serde(skip_deserializing, default = "Utc::now")]
    pub ingested_at: DateTime<Utc>,
}

impl SubmissionRecord for Checkout {
    const KIND: TableKind = TableKind::Checkout;
    fn id(&self) -> &str {
        &self.id
    }
    fn origin(&self) -> &str {
        &self.origin
    }
}

impl SubmissionRecord for Build {
    const KIND: TableKind = TableKind::Build;
    fn id(&self) -> &str {
        &self.id
    }
    fn origin(&self) -> &str {
        &self.origin
    }
    fn metric_labels(&self) -> Vec<(&'static str, String)> {
        vec![
            ("table", Self::KIND.section().to_owned()),
            ("origin", self.origin.clone()),
            ("lab", misc_label(self.misc.as_ref(), "lab")),
            ("platform", misc_label(self.misc.as_ref(), "platform")),
        ]
    }
}

impl SubmissionRecord for Test {
    const KIND: TableKind = TableKind::Test;
    fn id(&self) -> &str {
        &self.id
    }
    fn origin(&self) -> &str {
        &self.origin
    }
    fn metric_labels(&self) -> Vec<(&'static str, String)> {
        vec![
            ("table", Self::KIND.section().to_owned()),
            ("origin", self.origin.clone()),
            ("lab", misc_label(self.misc.as_ref(), "lab")),
            ("platform", misc_label(self.environment_misc.as_ref(), "platform")),
        ]
    }
}

impl SubmissionRecord for Issue {
    const KIND: TableKind = TableKind::Issue;
    fn id(&self) -> &str {
        &self.id
    }
    fn origin(&self) -> &str {
        &self.origin
    }
}

impl SubmissionRecord for Incident {
    const KIND: TableKind = TableKind::Incident;
    fn id(&self) -> &str {
        &self.id
    }
    fn origin(&self) -> &str {
        &self.origin
    }
}

/// The destination schema has no first-class lab/platform columns, so the
/// breakdown comes out of the misc blobs, defaulting to "unknown".
fn misc_label(misc: Option<&Value>, key: &str) -> String {
    misc.and_then(|m| m.get(key))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned()
}

pub const LOG_EXCERPT_FILE_NAME: &str = "logexcerpt.txt.gz";

impl HasLogExcerpt for Build {
    fn log_excerpt(&self) -> Option<&str> {
        self.log_excerpt.as_deref()
    }
    fn set_excerpt_reference(&mut self, url: String) {
        self.log_excerpt = Some(String::new());
        self.output_files.get_or_insert_with(Vec::new).push(OutputFile {
            name: LOG_EXCERPT_FILE_NAME.to_owned(),
            url,
        });
    }
}

impl HasLogExcerpt for Test {
    fn log_excerpt(&self) -> Option<&str> {
        self.log_excerpt.as_deref()
    }
    fn set_excerpt_reference(&mut self, url: String) {
        self.log_excerpt = Some(String::new());
        self.output_files.get_or_insert_with(Vec::new).push(OutputFile {
            name: LOG_EXCERPT_FILE_NAME.to_owned(),
            url,
        });
    }
}

/// Per-table record collections parsed out of one submission file, in the
/// fixed insert order, together with the count of items that were skipped.
#[derive(Debug, Default)]
pub struct ParsedSubmission {
    pub issues: Vec<Issue>,
    pub checkouts: Vec<Checkout>,
    pub builds: Vec<Build>,
    pub tests: Vec<Test>,
    pub incidents: Vec<Incident>,
    pub rejected: usize,
}

impl ParsedSubmission {
    pub fn accepted(&self) -> usize {
        self.issues.len()
            + self.checkouts.len()
            + self.builds.len()
            + self.tests.len()
            + self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_order_is_dependency_order() {
        let sections: Vec<_> = TableKind::ALL.iter().map(|k| k.section()).collect();
        assert_eq!(
            sections,
            vec!["issues", "checkouts", "builds", "tests", "incidents"]
        );
    }

    #[test]
    fn unknown_fields_are_dropped_not_errors() {
        let build: Build = serde_json::from_value(json!({
            "id": "b1",
            "checkout_id": "c1",
            "origin": "maestro",
            "status": "PASS",
            "bogus_field": 1
        }))
        .expect("unknown field should not fail deserialization");
        assert_eq!(build.id, "b1");
        assert_eq!(build.status.as_deref(), Some("PASS"));
    }

    #[test]
    fn build_flattens_culprit() {
        let mut item = json!({
            "id": "b1",
            "culprit": {"code": true, "tool": false}
        });
        let map = item.as_object_mut().unwrap();
        TableKind::Build.flatten(map);

        assert!(!map.contains_key("culprit"));
        assert_eq!(map["culprit_code"], json!(true));
        assert_eq!(map["culprit_tool"], json!(false));
    }

    #[test]
    fn test_flattens_environment_and_number() {
        let mut item = json!({
            "id": "t1",
            "environment": {"comment": "board", "misc": {"platform": "rk3399"}},
            "number": {"value": 42.0, "unit": "W"}
        });
        let map = item.as_object_mut().unwrap();
        TableKind::Test.flatten(map);

        assert_eq!(map["environment_comment"], json!("board"));
        assert_eq!(map["environment_misc"], json!({"platform": "rk3399"}));
        assert_eq!(map["number_value"], json!(42.0));
        assert_eq!(map["number_unit"], json!("W"));
        assert!(!map.contains_key("environment"));
        assert!(!map.contains_key("number"));
    }

    #[test]
    fn flatten_keeps_explicit_top_level_keys() {
        let mut item = json!({
            "number_value": 1.0,
            "number": {"value": 2.0}
        });
        let map = item.as_object_mut().unwrap();
        TableKind::Test.flatten(map);
        assert_eq!(map["number_value"], json!(1.0));
    }

    #[test]
    fn flatten_leaves_non_object_values_alone() {
        let mut item = json!({"culprit": "not-an-object"});
        let map = item.as_object_mut().unwrap();
        TableKind::Build.flatten(map);
        // Left in place; the field filter drops it later.
        assert_eq!(map["culprit"], json!("not-an-object"));
    }

    #[test]
    fn excerpt_reference_rewrite() {
        let mut test: Test = serde_json::from_value(json!({
            "id": "t1",
            "build_id": "b1",
            "origin": "maestro",
            "log_excerpt": "some long excerpt"
        }))
        .unwrap();

        test.set_excerpt_reference("https://files.example/logexcerpt".to_owned());
        assert_eq!(test.log_excerpt.as_deref(), Some(""));
        assert_eq!(
            test.output_files,
            Some(vec![OutputFile {
                name: LOG_EXCERPT_FILE_NAME.to_owned(),
                url: "https://files.example/logexcerpt".to_owned(),
            }])
        );
    }

    #[test]
    fn build_metric_labels_include_lab_and_platform() {
        let build: Build = serde_json::from_value(json!({
            "id": "b1",
            "checkout_id": "c1",
            "origin": "maestro",
            "misc": {"lab": "lab-collabora", "platform": "x86_64"}
        }))
        .unwrap();

        let labels = build.metric_labels();
        assert!(labels.contains(&("lab", "lab-collabora".to_owned())));
        assert!(labels.contains(&("platform", "x86_64".to_owned())));
    }

    #[test]
    fn ingestion_timestamp_is_stamped_at_construction() {
        let before = Utc::now();
        let checkout: Checkout = serde_json::from_value(json!({
            "id": "c1",
            "origin": "maestro"
        }))
        .unwrap();
        assert!(checkout.ingested_at >= before);
        assert!(checkout.ingested_at <= Utc::now());
    }
}
