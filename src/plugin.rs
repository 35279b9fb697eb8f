//! Mackerel agent plugin protocol.
//!
//! The agent runs the plugin once per interval. With
//! `MACKEREL_AGENT_PLUGIN_META=1` set it expects graph definitions on stdout,
//! otherwise one `name\tvalue\tepoch` line per metric.

use crate::error::AppError;
use crate::models::MetricMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const META_ENV: &str = "MACKEREL_AGENT_PLUGIN_META";
const META_HEADER: &str = "# mackerel-agent-plugin";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Graph {
    pub label: String,
    pub unit: String,
    pub metrics: Vec<GraphMetric>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GraphMetric {
    pub name: String,
    pub label: String,
    pub stacked: bool,
}

pub type GraphDefinitions = BTreeMap<String, Graph>;

fn stacked(name: &str, label: &str) -> GraphMetric {
    GraphMetric {
        name: name.into(),
        label: label.into(),
        stacked: true,
    }
}

/// Graphs for every metric the plugin can emit, whichever one is selected.
/// All of them are absolute values; nothing is diffed against the temp file.
pub fn billing_graphs() -> GraphDefinitions {
    BTreeMap::from([
        (
            "usage.#".to_string(),
            Graph {
                label: "AWS Monthly Billing".into(),
                unit: "integer".into(),
                metrics: vec![
                    stacked("BlendedCost", "Blended Cost"),
                    stacked("UnblendedCost", "Unblended Cost"),
                    stacked("UsageQuantity", "Usage Quantity"),
                ],
            },
        ),
        (
            "forecast.#".to_string(),
            Graph {
                label: "AWS Monthly Billing Forecast".into(),
                unit: "integer".into(),
                metrics: vec![
                    stacked("ForecastBlendedCost", "Forecast Blended Cost"),
                    stacked("ForecastUnblendedCost", "Forecast Unblended Cost"),
                    stacked("ForecastUsageQuantity", "Forecast Usage Quantity"),
                ],
            },
        ),
    ])
}

pub fn meta_requested(lookup: impl Fn(&str) -> Option<String>) -> bool {
    lookup(META_ENV).as_deref() == Some("1")
}

/// Upper-cases every letter that follows a non-alphanumeric character.
fn title_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut boundary = true;
    for c in raw.chars() {
        if boundary {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        boundary = !(c.is_alphanumeric() || c == '_');
    }
    out
}

/// A non-empty run of `[-a-zA-Z0-9_]`, the only thing a wildcard matches.
pub fn is_metric_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// `#` and `*` stand for exactly one key segment.
fn matches_pattern(pattern: &str, key: &str) -> bool {
    let mut pattern_parts = pattern.split('.');
    let mut key_parts = key.split('.');
    loop {
        match (pattern_parts.next(), key_parts.next()) {
            (None, None) => return true,
            (Some("#" | "*"), Some(segment)) if is_metric_segment(segment) => {}
            (Some("#" | "*"), _) => return false,
            (Some(expected), Some(segment)) if expected == segment => {}
            _ => return false,
        }
    }
}

fn format_value(value: f64) -> String {
    format!("{value:.6}")
}

pub struct MackerelPlugin {
    prefix: String,
    graphs: GraphDefinitions,
    tempfile: PathBuf,
}

impl MackerelPlugin {
    pub fn new(prefix: impl Into<String>, graphs: GraphDefinitions, tempfile: PathBuf) -> Self {
        Self {
            prefix: prefix.into(),
            graphs,
            tempfile,
        }
    }

    pub fn tempfile(&self) -> &Path {
        &self.tempfile
    }

    fn qualify(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.prefix)
        }
    }

    pub fn definitions(&self) -> serde_json::Value {
        let label_prefix = title_case(&self.prefix);
        let graphs: BTreeMap<String, Graph> = self
            .graphs
            .iter()
            .map(|(key, graph)| {
                let mut graph = graph.clone();
                if !label_prefix.is_empty() && !graph.label.starts_with(&label_prefix) {
                    graph.label = format!("{label_prefix} {}", graph.label);
                }
                (self.qualify(key), graph)
            })
            .collect();
        json!({ "graphs": graphs })
    }

    pub fn print_definitions(&self, out: &mut impl Write) -> Result<(), AppError> {
        writeln!(out, "{META_HEADER}")?;
        serde_json::to_writer(&mut *out, &self.definitions())?;
        writeln!(out)?;
        Ok(())
    }

    /// Writes every metric some graph declares and returns what was written.
    pub fn output_values(
        &self,
        out: &mut impl Write,
        metrics: &MetricMap,
        now: DateTime<Utc>,
    ) -> Result<MetricMap, AppError> {
        let mut emitted = MetricMap::new();
        for (key, value) in metrics {
            let declared = self.graphs.iter().any(|(graph_key, graph)| {
                graph
                    .metrics
                    .iter()
                    .any(|m| matches_pattern(&format!("{graph_key}.{}", m.name), key))
            });
            if !declared {
                warn!(key = %key, "metric matches no graph definition; skipped");
                continue;
            }
            if !value.is_finite() {
                warn!(key = %key, value, "non-finite metric value; skipped");
                continue;
            }

            writeln!(
                out,
                "{}\t{}\t{}",
                self.qualify(key),
                format_value(*value),
                now.timestamp()
            )?;
            emitted.insert(key.clone(), *value);
        }
        Ok(emitted)
    }

    /// Persists the emitted values for the agent framework's diff bookkeeping.
    pub fn save_values(&self, values: &MetricMap, now: DateTime<Utc>) -> Result<(), AppError> {
        let mut stored = values.clone();
        stored.insert("_lastTime".into(), now.timestamp() as f64);
        let raw = serde_json::to_vec(&stored)?;
        fs::write(&self.tempfile, raw).map_err(|e| {
            AppError::Config(format!(
                "failed to write tempfile {}: {e}",
                self.tempfile.display()
            ))
        })?;
        debug!(path = %self.tempfile.display(), "saved plugin values");
        Ok(())
    }
}
