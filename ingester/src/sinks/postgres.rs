use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::SinkError;
use crate::sink::SubmissionSink;
use crate::types::{Build, Checkout, Incident, Issue, OutputFile, Test};

/// Sink writing record batches to the relational store, one UNNEST-array
/// upsert statement per batch.
///
/// The conflict merge protects earlier, more complete submissions of the
/// same entity: nullable columns keep the stored value unless it is null,
/// while timestamps, durations and other monotonic numerics take the
/// greatest value (`GREATEST` ignores nulls in Postgres). The ingestion
/// timestamp always takes the greatest value, so re-ingesting identical
/// data is observable only there.
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub fn new(database_url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)
            .map_err(|error| SinkError::PoolCreation { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn files_json(files: &Option<Vec<OutputFile>>) -> Option<Value> {
    files
        .as_ref()
        .map(|f| serde_json::to_value(f).unwrap_or(Value::Null))
}

fn strings_json(strings: &Option<Vec<String>>) -> Option<Value> {
    strings
        .as_ref()
        .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
}

#[async_trait]
impl SubmissionSink for PostgresSink {
    async fn upsert_issues(&self, batch: Vec<Issue>) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut origins = Vec::with_capacity(batch.len());
        let mut versions: Vec<Option<i64>> = Vec::with_capacity(batch.len());
        let mut report_urls = Vec::with_capacity(batch.len());
        let mut report_subjects = Vec::with_capacity(batch.len());
        let mut culprit_codes: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut culprit_tools: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut culprit_harnesses: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut build_valids: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut test_statuses = Vec::with_capacity(batch.len());
        let mut comments = Vec::with_capacity(batch.len());
        let mut miscs: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut ingested_ats: Vec<DateTime<Utc>> = Vec::with_capacity(batch.len());

        for issue in batch {
            ids.push(issue.id);
            origins.push(issue.origin);
            versions.push(issue.version);
            report_urls.push(issue.report_url);
            report_subjects.push(issue.report_subject);
            culprit_codes.push(issue.culprit_code);
            culprit_tools.push(issue.culprit_tool);
            culprit_harnesses.push(issue.culprit_harness);
            build_valids.push(issue.build_valid);
            test_statuses.push(issue.test_status);
            comments.push(issue.comment);
            miscs.push(issue.misc);
            ingested_ats.push(issue.ingested_at);
        }

        sqlx::query(
            r#"
INSERT INTO issues (
    id, origin, version, report_url, report_subject, culprit_code,
    culprit_tool, culprit_harness, build_valid, test_status, comment, misc,
    ingested_at)
(SELECT * FROM UNNEST(
    $1::text[], $2::text[], $3::bigint[], $4::text[], $5::text[],
    $6::bool[], $7::bool[], $8::bool[], $9::bool[], $10::text[],
    $11::text[], $12::jsonb[], $13::timestamptz[]))
ON CONFLICT (id) DO UPDATE SET
    version = GREATEST(issues.version, EXCLUDED.version),
    report_url = COALESCE(issues.report_url, EXCLUDED.report_url),
    report_subject = COALESCE(issues.report_subject, EXCLUDED.report_subject),
    culprit_code = COALESCE(issues.culprit_code, EXCLUDED.culprit_code),
    culprit_tool = COALESCE(issues.culprit_tool, EXCLUDED.culprit_tool),
    culprit_harness = COALESCE(issues.culprit_harness, EXCLUDED.culprit_harness),
    build_valid = COALESCE(issues.build_valid, EXCLUDED.build_valid),
    test_status = COALESCE(issues.test_status, EXCLUDED.test_status),
    comment = COALESCE(issues.comment, EXCLUDED.comment),
    misc = COALESCE(issues.misc, EXCLUDED.misc),
    ingested_at = GREATEST(issues.ingested_at, EXCLUDED.ingested_at)"#,
        )
        .bind(&ids)
        .bind(&origins)
        .bind(&versions)
        .bind(&report_urls)
        .bind(&report_subjects)
        .bind(&culprit_codes)
        .bind(&culprit_tools)
        .bind(&culprit_harnesses)
        .bind(&build_valids)
        .bind(&test_statuses)
        .bind(&comments)
        .bind(&miscs)
        .bind(&ingested_ats)
        .execute(&self.pool)
        .await
        .map_err(|error| SinkError::Upsert {
            table: "issues",
            error,
        })?;

        Ok(())
    }

    async fn upsert_checkouts(&self, batch: Vec<Checkout>) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut origins = Vec::with_capacity(batch.len());
        let mut tree_names = Vec::with_capacity(batch.len());
        let mut git_repository_urls = Vec::with_capacity(batch.len());
        let mut git_commit_hashes = Vec::with_capacity(batch.len());
        let mut git_commit_names = Vec::with_capacity(batch.len());
        let mut git_repository_branches = Vec::with_capacity(batch.len());
        let mut patchset_hashes = Vec::with_capacity(batch.len());
        let mut message_ids = Vec::with_capacity(batch.len());
        let mut comments = Vec::with_capacity(batch.len());
        let mut start_times: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(batch.len());
        let mut contacts: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut log_urls = Vec::with_capacity(batch.len());
        let mut log_excerpts = Vec::with_capacity(batch.len());
        let mut valids: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut miscs: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut ingested_ats: Vec<DateTime<Utc>> = Vec::with_capacity(batch.len());

        for checkout in batch {
            ids.push(checkout.id);
            origins.push(checkout.origin);
            tree_names.push(checkout.tree_name);
            git_repository_urls.push(checkout.git_repository_url);
            git_commit_hashes.push(checkout.git_commit_hash);
            git_commit_names.push(checkout.git_commit_name);
            git_repository_branches.push(checkout.git_repository_branch);
            patchset_hashes.push(checkout.patchset_hash);
            message_ids.push(checkout.message_id);
            comments.push(checkout.comment);
            start_times.push(checkout.start_time);
            contacts.push(strings_json(&checkout.contacts));
            log_urls.push(checkout.log_url);
            log_excerpts.push(checkout.log_excerpt);
            valids.push(checkout.valid);
            miscs.push(checkout.misc);
            ingested_ats.push(checkout.ingested_at);
        }

        sqlx::query(
            r#"
INSERT INTO checkouts (
    id, origin, tree_name, git_repository_url, git_commit_hash,
    git_commit_name, git_repository_branch, patchset_hash, message_id,
    comment, start_time, contacts, log_url, log_excerpt, valid, misc,
    ingested_at)
(SELECT * FROM UNNEST(
    $1::text[], $2::text[], $3::text[], $4::text[], $5::text[],
    $6::text[], $7::text[], $8::text[], $9::text[], $10::text[],
    $11::timestamptz[], $12::jsonb[], $13::text[], $14::text[],
    $15::bool[], $16::jsonb[], $17::timestamptz[]))
ON CONFLICT (id) DO UPDATE SET
    tree_name = COALESCE(checkouts.tree_name, EXCLUDED.tree_name),
    git_repository_url = COALESCE(checkouts.git_repository_url, EXCLUDED.git_repository_url),
    git_commit_hash = COALESCE(checkouts.git_commit_hash, EXCLUDED.git_commit_hash),
    git_commit_name = COALESCE(checkouts.git_commit_name, EXCLUDED.git_commit_name),
    git_repository_branch = COALESCE(checkouts.git_repository_branch, EXCLUDED.git_repository_branch),
    patchset_hash = COALESCE(checkouts.patchset_hash, EXCLUDED.patchset_hash),
    message_id = COALESCE(checkouts.message_id, EXCLUDED.message_id),
    comment = COALESCE(checkouts.comment, EXCLUDED.comment),
    start_time = GREATEST(checkouts.start_time, EXCLUDED.start_time),
    contacts = COALESCE(checkouts.contacts, EXCLUDED.contacts),
    log_url = COALESCE(checkouts.log_url, EXCLUDED.log_url),
    log_excerpt = COALESCE(checkouts.log_excerpt, EXCLUDED.log_excerpt),
    valid = COALESCE(checkouts.valid, EXCLUDED.valid),
    misc = COALESCE(checkouts.misc, EXCLUDED.misc),
    ingested_at = GREATEST(checkouts.ingested_at, EXCLUDED.ingested_at)"#,
        )
        .bind(&ids)
        .bind(&origins)
        .bind(&tree_names)
        .bind(&git_repository_urls)
        .bind(&git_commit_hashes)
        .bind(&git_commit_names)
        .bind(&git_repository_branches)
        .bind(&patchset_hashes)
        .bind(&message_ids)
        .bind(&comments)
        .bind(&start_times)
        .bind(&contacts)
        .bind(&log_urls)
        .bind(&log_excerpts)
        .bind(&valids)
        .bind(&miscs)
        .bind(&ingested_ats)
        .execute(&self.pool)
        .await
        .map_err(|error| SinkError::Upsert {
            table: "checkouts",
            error,
        })?;

        Ok(())
    }

    async fn upsert_builds(&self, batch: Vec<Build>) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut checkout_ids = Vec::with_capacity(batch.len());
        let mut origins = Vec::with_capacity(batch.len());
        let mut comments = Vec::with_capacity(batch.len());
        let mut start_times: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(batch.len());
        let mut durations: Vec<Option<f64>> = Vec::with_capacity(batch.len());
        let mut architectures = Vec::with_capacity(batch.len());
        let mut commands = Vec::with_capacity(batch.len());
        let mut compilers = Vec::with_capacity(batch.len());
        let mut input_files: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut output_files: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut config_names = Vec::with_capacity(batch.len());
        let mut config_urls = Vec::with_capacity(batch.len());
        let mut log_urls = Vec::with_capacity(batch.len());
        let mut log_excerpts = Vec::with_capacity(batch.len());
        let mut valids: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut statuses = Vec::with_capacity(batch.len());
        let mut culprit_codes: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut culprit_tools: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut culprit_harnesses: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut miscs: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut ingested_ats: Vec<DateTime<Utc>> = Vec::with_capacity(batch.len());

        for build in batch {
            ids.push(build.id);
            checkout_ids.push(build.checkout_id);
            origins.push(build.origin);
            comments.push(build.comment);
            start_times.push(build.start_time);
            durations.push(build.duration);
            architectures.push(build.architecture);
            commands.push(build.command);
            compilers.push(build.compiler);
            input_files.push(files_json(&build.input_files));
            output_files.push(files_json(&build.output_files));
            config_names.push(build.config_name);
            config_urls.push(build.config_url);
            log_urls.push(build.log_url);
            log_excerpts.push(build.log_excerpt);
            valids.push(build.valid);
            statuses.push(build.status);
            culprit_codes.push(build.culprit_code);
            culprit_tools.push(build.culprit_tool);
            culprit_harnesses.push(build.culprit_harness);
            miscs.push(build.misc);
            ingested_ats.push(build.ingested_at);
        }

        sqlx::query(
            r#"
INSERT INTO builds (
    id, checkout_id, origin, comment, start_time, duration, architecture,
    command, compiler, input_files, output_files, config_name, config_url,
    log_url, log_excerpt, valid, status, culprit_code, culprit_tool,
    culprit_harness, misc, ingested_at)
(SELECT * FROM UNNEST(
    $1::text[], $2::text[], $3::text[], $4::text[], $5::timestamptz[],
    $6::float8[], $7::text[], $8::text[], $9::text[], $10::jsonb[],
    $11::jsonb[], $12::text[], $13::text[], $14::text[], $15::text[],
    $16::bool[], $17::text[], $18::bool[], $19::bool[], $20::bool[],
    $21::jsonb[], $22::timestamptz[]))
ON CONFLICT (id) DO UPDATE SET
    comment = COALESCE(builds.comment, EXCLUDED.comment),
    start_time = GREATEST(builds.start_time, EXCLUDED.start_time),
    duration = GREATEST(builds.duration, EXCLUDED.duration),
    architecture = COALESCE(builds.architecture, EXCLUDED.architecture),
    command = COALESCE(builds.command, EXCLUDED.command),
    compiler = COALESCE(builds.compiler, EXCLUDED.compiler),
    input_files = COALESCE(builds.input_files, EXCLUDED.input_files),
    output_files = COALESCE(builds.output_files, EXCLUDED.output_files),
    config_name = COALESCE(builds.config_name, EXCLUDED.config_name),
    config_url = COALESCE(builds.config_url, EXCLUDED.config_url),
    log_url = COALESCE(builds.log_url, EXCLUDED.log_url),
    log_excerpt = COALESCE(builds.log_excerpt, EXCLUDED.log_excerpt),
    valid = COALESCE(builds.valid, EXCLUDED.valid),
    status = COALESCE(builds.status, EXCLUDED.status),
    culprit_code = COALESCE(builds.culprit_code, EXCLUDED.culprit_code),
    culprit_tool = COALESCE(builds.culprit_tool, EXCLUDED.culprit_tool),
    culprit_harness = COALESCE(builds.culprit_harness, EXCLUDED.culprit_harness),
    misc = COALESCE(builds.misc, EXCLUDED.misc),
    ingested_at = GREATEST(builds.ingested_at, EXCLUDED.ingested_at)"#,
        )
        .bind(&ids)
        .bind(&checkout_ids)
        .bind(&origins)
        .bind(&comments)
        .bind(&start_times)
        .bind(&durations)
        .bind(&architectures)
        .bind(&commands)
        .bind(&compilers)
        .bind(&input_files)
        .bind(&output_files)
        .bind(&config_names)
        .bind(&config_urls)
        .bind(&log_urls)
        .bind(&log_excerpts)
        .bind(&valids)
        .bind(&statuses)
        .bind(&culprit_codes)
        .bind(&culprit_tools)
        .bind(&culprit_harnesses)
        .bind(&miscs)
        .bind(&ingested_ats)
        .execute(&self.pool)
        .await
        .map_err(|error| SinkError::Upsert {
            table: "builds",
            error,
        })?;

        Ok(())
    }

    async fn upsert_tests(&self, batch: Vec<Test>) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut build_ids = Vec::with_capacity(batch.len());
        let mut origins = Vec::with_capacity(batch.len());
        let mut paths = Vec::with_capacity(batch.len());
        let mut comments = Vec::with_capacity(batch.len());
        let mut log_urls = Vec::with_capacity(batch.len());
        let mut log_excerpts = Vec::with_capacity(batch.len());
        let mut statuses = Vec::with_capacity(batch.len());
        let mut waiveds: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut start_times: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(batch.len());
        let mut durations: Vec<Option<f64>> = Vec::with_capacity(batch.len());
        let mut output_files: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut environment_comments = Vec::with_capacity(batch.len());
        let mut environment_compatibles: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut environment_miscs: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut number_values: Vec<Option<f64>> = Vec::with_capacity(batch.len());
        let mut number_units = Vec::with_capacity(batch.len());
        let mut number_prefixes = Vec::with_capacity(batch.len());
        let mut miscs: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut ingested_ats: Vec<DateTime<Utc>> = Vec::with_capacity(batch.len());

        for test in batch {
            ids.push(test.id);
            build_ids.push(test.build_id);
            origins.push(test.origin);
            paths.push(test.path);
            comments.push(test.comment);
            log_urls.push(test.log_url);
            log_excerpts.push(test.log_excerpt);
            statuses.push(test.status);
            waiveds.push(test.waived);
            start_times.push(test.start_time);
            durations.push(test.duration);
            output_files.push(files_json(&test.output_files));
            environment_comments.push(test.environment_comment);
            environment_compatibles.push(strings_json(&test.environment_compatible));
            environment_miscs.push(test.environment_misc);
            number_values.push(test.number_value);
            number_units.push(test.number_unit);
            number_prefixes.push(test.number_prefix);
            miscs.push(test.misc);
            ingested_ats.push(test.ingested_at);
        }

        sqlx::query(
            r#"
INSERT INTO tests (
    id, build_id, origin, path, comment, log_url, log_excerpt, status,
    waived, start_time, duration, output_files, environment_comment,
    environment_compatible, environment_misc, number_value, number_unit,
    number_prefix, misc, ingested_at)
(SELECT * FROM UNNEST(
    $1::text[], $2::text[], $3::text[], $4::text[], $5::text[],
    $6::text[], $7::text[], $8::text[], $9::bool[], $10::timestamptz[],
    $11::float8[], $12::jsonb[], $13::text[], $14::jsonb[], $15::jsonb[],
    $16::float8[], $17::text[], $18::text[], $19::jsonb[],
    $20::timestamptz[]))
ON CONFLICT (id) DO UPDATE SET
    path = COALESCE(tests.path, EXCLUDED.path),
    comment = COALESCE(tests.comment, EXCLUDED.comment),
    log_url = COALESCE(tests.log_url, EXCLUDED.log_url),
    log_excerpt = COALESCE(tests.log_excerpt, EXCLUDED.log_excerpt),
    status = COALESCE(tests.status, EXCLUDED.status),
    waived = COALESCE(tests.waived, EXCLUDED.waived),
    start_time = GREATEST(tests.start_time, EXCLUDED.start_time),
    duration = GREATEST(tests.duration, EXCLUDED.duration),
    output_files = COALESCE(tests.output_files, EXCLUDED.output_files),
    environment_comment = COALESCE(tests.environment_comment, EXCLUDED.environment_comment),
    environment_compatible = COALESCE(tests.environment_compatible, EXCLUDED.environment_compatible),
    environment_misc = COALESCE(tests.environment_misc, EXCLUDED.environment_misc),
    number_value = GREATEST(tests.number_value, EXCLUDED.number_value),
    number_unit = COALESCE(tests.number_unit, EXCLUDED.number_unit),
    number_prefix = COALESCE(tests.number_prefix, EXCLUDED.number_prefix),
    misc = COALESCE(tests.misc, EXCLUDED.misc),
    ingested_at = GREATEST(tests.ingested_at, EXCLUDED.ingested_at)"#,
        )
        .bind(&ids)
        .bind(&build_ids)
        .bind(&origins)
        .bind(&paths)
        .bind(&comments)
        .bind(&log_urls)
        .bind(&log_excerpts)
        .bind(&statuses)
        .bind(&waiveds)
        .bind(&start_times)
        .bind(&durations)
        .bind(&output_files)
        .bind(&environment_comments)
        .bind(&environment_compatibles)
        .bind(&environment_miscs)
        .bind(&number_values)
        .bind(&number_units)
        .bind(&number_prefixes)
        .bind(&miscs)
        .bind(&ingested_ats)
        .execute(&self.pool)
        .await
        .map_err(|error| SinkError::Upsert {
            table: "tests",
            error,
        })?;

        Ok(())
    }

    async fn upsert_incidents(&self, batch: Vec<Incident>) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut origins = Vec::with_capacity(batch.len());
        let mut issue_ids = Vec::with_capacity(batch.len());
        let mut issue_versions: Vec<Option<i64>> = Vec::with_capacity(batch.len());
        let mut build_ids = Vec::with_capacity(batch.len());
        let mut test_ids = Vec::with_capacity(batch.len());
        let mut presents: Vec<Option<bool>> = Vec::with_capacity(batch.len());
        let mut comments = Vec::with_capacity(batch.len());
        let mut miscs: Vec<Option<Value>> = Vec::with_capacity(batch.len());
        let mut ingested_ats: Vec<DateTime<Utc>> = Vec::with_capacity(batch.len());

        for incident in batch {
            ids.push(incident.id);
            origins.push(incident.origin);
            issue_ids.push(incident.issue_id);
            issue_versions.push(incident.issue_version);
            build_ids.push(incident.build_id);
            test_ids.push(incident.test_id);
            presents.push(incident.present);
            comments.push(incident.comment);
            miscs.push(incident.misc);
            ingested_ats.push(incident.ingested_at);
        }

        sqlx::query(
            r#"
INSERT INTO incidents (
    id, origin, issue_id, issue_version, build_id, test_id, present,
    comment, misc, ingested_at)
(SELECT * FROM UNNEST(
    $1::text[], $2::text[], $3::text[], $4::bigint[], $5::text[],
    $6::text[], $7::bool[], $8::text[], $9::jsonb[], $10::timestamptz[]))
ON CONFLICT (id) DO UPDATE SET
    issue_version = GREATEST(incidents.issue_version, EXCLUDED.issue_version),
    build_id = COALESCE(incidents.build_id, EXCLUDED.build_id),
    test_id = COALESCE(incidents.test_id, EXCLUDED.test_id),
    present = COALESCE(incidents.present, EXCLUDED.present),
    comment = COALESCE(incidents.comment, EXCLUDED.comment),
    misc = COALESCE(incidents.misc, EXCLUDED.misc),
    ingested_at = GREATEST(incidents.ingested_at, EXCLUDED.ingested_at)"#,
        )
        .bind(&ids)
        .bind(&origins)
        .bind(&issue_ids)
        .bind(&issue_versions)
        .bind(&build_ids)
        .bind(&test_ids)
        .bind(&presents)
        .bind(&comments)
        .bind(&miscs)
        .bind(&ingested_ats)
        .execute(&self.pool)
        .await
        .map_err(|error| SinkError::Upsert {
            table: "incidents",
            error,
        })?;

        Ok(())
    }
}
