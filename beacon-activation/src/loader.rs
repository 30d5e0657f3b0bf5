use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::context::AdminContext;
use crate::error::ActivationError;
use crate::kind::{LogLevel, TelemetryKind};
use crate::rule::{RuleKey, GLOBAL_TENANT};
use crate::store::{ActivationStore, BulkOutcome};
use crate::validation::EnableRequest;

/// One activation declared in a seed file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SeedRule {
    pub pattern: String,
    pub kind: TelemetryKind,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    #[serde(default)]
    pub min_log_level: Option<LogLevel>,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub active_to: Option<DateTime<Utc>>,
}

fn default_tenant() -> String {
    GLOBAL_TENANT.to_string()
}

fn default_sampling_rate() -> f64 {
    1.0
}

impl SeedRule {
    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.kind, &self.pattern, &self.tenant)
    }

    pub fn to_request(&self) -> EnableRequest {
        let mut request =
            EnableRequest::new(self.pattern.clone(), self.kind, self.tenant.clone()).sampling_rate(self.sampling_rate);
        if let Some(level) = self.min_log_level {
            request = request.min_log_level(level);
        }
        match (self.active_to, self.duration_minutes) {
            (Some(end), _) => request.until(end),
            (None, Some(minutes)) => request.lasting_minutes(minutes),
            (None, None) => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SeedDocument {
    rules: Vec<SeedRule>,
}

/// Reads seed activations from a YAML/JSON file or a directory of them.
pub fn load_seed(path: impl AsRef<Path>) -> Result<Vec<SeedRule>, ActivationError> {
    let path = path.as_ref();
    let mut rules = if path.is_dir() {
        load_from_directory(path)?
    } else {
        load_from_file(path)?
    };

    deduplicate(&rules)?;
    rules.sort_by(|a, b| a.key().cmp(&b.key()));
    Ok(rules)
}

fn load_from_directory(path: &Path) -> Result<Vec<SeedRule>, ActivationError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).map_err(|err| io_error(path, err))? {
        let entry = entry.map_err(|err| io_error(path, err))?;
        let file_type = entry.file_type().map_err(|err| io_error(&entry.path(), err))?;
        if file_type.is_dir() {
            continue;
        }
        let entry_path = entry.path();
        if let Some(ext) = entry_path.extension().and_then(|value| value.to_str()) {
            if matches!(ext, "json" | "yaml" | "yml") {
                entries.push(entry_path);
            }
        }
    }
    entries.sort();

    let mut rules = Vec::new();
    for entry in entries {
        rules.append(&mut load_from_file(&entry)?);
    }
    Ok(rules)
}

fn load_from_file(path: &Path) -> Result<Vec<SeedRule>, ActivationError> {
    let raw = fs::read_to_string(path).map_err(|err| io_error(path, err))?;
    parse_seed(&raw, path)
}

fn parse_seed(raw: &str, path: &Path) -> Result<Vec<SeedRule>, ActivationError> {
    if let Ok(doc) = serde_yaml::from_str::<SeedDocument>(raw) {
        return Ok(doc.rules);
    }
    if let Ok(list) = serde_yaml::from_str::<Vec<SeedRule>>(raw) {
        return Ok(list);
    }
    match serde_yaml::from_str::<SeedRule>(raw) {
        Ok(rule) => Ok(vec![rule]),
        Err(err) => Err(ActivationError::SeedParse {
            path: path.display().to_string(),
            message: err.to_string(),
        }),
    }
}

fn deduplicate(rules: &[SeedRule]) -> Result<(), ActivationError> {
    let mut seen = HashSet::new();
    for rule in rules {
        let key = rule.key();
        if !seen.insert(key.clone()) {
            return Err(ActivationError::DuplicateSeed(key.to_string()));
        }
    }
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> ActivationError {
    ActivationError::SeedIo {
        path: path.display().to_string(),
        source,
    }
}

impl ActivationStore {
    /// Enables every seed rule as the `system:seed` actor.
    pub async fn apply_seed(&self, rules: &[SeedRule]) -> BulkOutcome {
        let ctx = AdminContext::system("seed");
        let requests = rules.iter().map(SeedRule::to_request).collect();
        let outcome = self.enable_each(&ctx, requests).await;
        info!(seeded = outcome.succeeded, failed = outcome.failed, "applied activation seed");
        outcome
    }
}
