//! `em list` and `em show`.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

use crate::core::error::EmError;
use crate::core::types::ExperimentRecord;
use crate::project::Project;

/// `key=value` filter over record fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for RecordFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("filter must look like <field>=<value> (got '{s}')"))?;
        Ok(Self {
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

impl RecordFilter {
    pub fn matches(&self, record: &ExperimentRecord) -> Result<bool> {
        let fields = record_fields(record)?;
        Ok(fields.get(&self.key).map(render) == Some(self.value.clone()))
    }
}

/// Experiment names in order, optionally filtered.
pub fn list_experiments(project: &Project, filter: Option<&RecordFilter>) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for item in project.store.list()? {
        let (name, record) = item?;
        if let Some(filter) = filter
            && !filter.matches(&record)?
        {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// `key: value` lines for a record (sorted by key), followed by the
/// program's options when `with_opts` is set.
pub fn show_experiment(project: &Project, name: &str, with_opts: bool) -> Result<String> {
    let record = project
        .store
        .get(name)?
        .ok_or_else(|| EmError::NoSuchExperiment(name.to_string()))?;
    let mut out = String::new();
    let sorted: BTreeMap<String, Value> = record_fields(&record)?.into_iter().collect();
    for (key, value) in sorted {
        out.push_str(&format!("{key}: {}\n", render(&value)));
    }
    if with_opts {
        let path = project
            .paths
            .opts_path(name)?
            .ok_or_else(|| anyhow!("experiment {name} has no recorded options"))?;
        let opts =
            fs::read_to_string(&path).with_context(|| format!("read options {}", path.display()))?;
        out.push_str("\noptions:\n");
        out.push_str(&opts);
        if !opts.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(out)
}

fn record_fields(record: &ExperimentRecord) -> Result<serde_json::Map<String, Value>> {
    match serde_json::to_value(record).context("serialize record")? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("record serialized to non-object {other}")),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExperimentStatus;

    #[test]
    fn filter_parses_and_matches_rendered_fields() {
        let filter: RecordFilter = "status=running".parse().expect("parse");
        let mut record = ExperimentRecord::starting();
        assert!(!filter.matches(&record).expect("match"));
        record.status = ExperimentStatus::Running;
        assert!(filter.matches(&record).expect("match"));

        let by_pid: RecordFilter = "pid=42".parse().expect("parse");
        record.pid = Some(42);
        assert!(by_pid.matches(&record).expect("match"));
    }

    #[test]
    fn filter_without_equals_is_rejected() {
        assert!("status".parse::<RecordFilter>().is_err());
    }

    #[test]
    fn absent_field_never_matches() {
        let filter: RecordFilter = "gpu=0".parse().expect("parse");
        assert!(!filter.matches(&ExperimentRecord::starting()).expect("match"));
    }
}
