//! Telemetry polling for fleet nodes
//!
//! Three diagnostic commands per node, each with an explicit output schema:
//! - GPU: `nvidia-smi --query-gpu=...` one CSV record of 7 fields
//! - CPU: `/proc/loadavg`, first token is the 1-minute load average
//! - Memory: `free -m`, second line `{label, total, used, free, ...}` in MB
//!
//! A parser either returns a typed record or a `ParseError`; nothing is
//! written to the registry from a partial record.

use crate::config::TelemetryConf;
use crate::dispatcher::{Outcome, OutcomeMap};
use crate::error::Result;
use crate::fleet::Fleet;
use crate::models::{GpuMetrics, MemoryMetrics, NodeId, NodeStatus};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{source_name}: expected {expected} fields, found {found}")]
    FieldCount {
        source_name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{source_name}: field '{field}' is not a number: '{value}'")]
    InvalidNumber {
        source_name: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("{source_name}: missing line {line}")]
    MissingLine { source_name: &'static str, line: usize },

    #[error("{source_name}: {reason}")]
    Invalid { source_name: &'static str, reason: String },
}

/// Full `--query-gpu` record, in query order
#[derive(Debug, Clone, PartialEq)]
pub struct GpuRecord {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub temperature_c: f64,
    pub utilization_pct: f64,
    pub power_draw_w: f64,
}

const GPU_FIELDS: [&str; 7] = [
    "index",
    "name",
    "memory.total",
    "memory.used",
    "temperature.gpu",
    "utilization.gpu",
    "power.draw",
];

fn number<T: std::str::FromStr>(source_name: &'static str, field: &'static str, value: &str) -> std::result::Result<T, ParseError> {
    value.trim().parse().map_err(|_| ParseError::InvalidNumber {
        source_name,
        field,
        value: value.trim().to_string(),
    })
}

impl GpuRecord {
    /// Parse the first non-empty line (one GPU per node)
    pub fn parse(text: &str) -> std::result::Result<Self, ParseError> {
        let line = text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or(ParseError::MissingLine { source_name: "gpu", line: 1 })?;

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != GPU_FIELDS.len() {
            return Err(ParseError::FieldCount {
                source_name: "gpu",
                expected: GPU_FIELDS.len(),
                found: fields.len(),
            });
        }
        if fields[1].is_empty() {
            return Err(ParseError::Invalid { source_name: "gpu", reason: "empty GPU name".into() });
        }

        Ok(Self {
            index: number("gpu", GPU_FIELDS[0], fields[0])?,
            name: fields[1].to_string(),
            memory_total_mb: number("gpu", GPU_FIELDS[2], fields[2])?,
            memory_used_mb: number("gpu", GPU_FIELDS[3], fields[3])?,
            temperature_c: number("gpu", GPU_FIELDS[4], fields[4])?,
            utilization_pct: number("gpu", GPU_FIELDS[5], fields[5])?,
            power_draw_w: number("gpu", GPU_FIELDS[6], fields[6])?,
        })
    }

    pub fn into_metrics(self) -> GpuMetrics {
        GpuMetrics {
            index: self.index,
            model: self.name,
            memory_mb: self.memory_total_mb,
            temperature_c: self.temperature_c,
            utilization_pct: self.utilization_pct,
            power_draw_w: self.power_draw_w,
        }
    }
}

pub fn parse_load_average(text: &str) -> std::result::Result<f64, ParseError> {
    let token = text
        .split_whitespace()
        .next()
        .ok_or(ParseError::MissingLine { source_name: "loadavg", line: 1 })?;
    let load: f64 = number("loadavg", "load1", token)?;
    if !load.is_finite() || load < 0.0 {
        return Err(ParseError::Invalid { source_name: "loadavg", reason: format!("bad load average {load}") });
    }
    Ok(load)
}

/// `round(load / threads * 100)`, not clamped: an overloaded node reads above 100
pub fn cpu_usage_from_load(load: f64, threads: u32) -> Option<f64> {
    if threads == 0 {
        return None;
    }
    Some((load / threads as f64 * 100.0).round())
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryReport {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
}

impl MemoryReport {
    pub fn parse(text: &str) -> std::result::Result<Self, ParseError> {
        let line = text
            .lines()
            .nth(1)
            .ok_or(ParseError::MissingLine { source_name: "memory", line: 2 })?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(ParseError::FieldCount { source_name: "memory", expected: 4, found: fields.len() });
        }
        let report = Self {
            total_mb: number("memory", "total", fields[1])?,
            used_mb: number("memory", "used", fields[2])?,
            free_mb: number("memory", "free", fields[3])?,
        };
        if report.total_mb == 0 {
            return Err(ParseError::Invalid { source_name: "memory", reason: "total is zero".into() });
        }
        Ok(report)
    }

    pub fn into_metrics(self) -> MemoryMetrics {
        let total_gb = self.total_mb as f64 / 1024.0;
        let used_gb = self.used_mb as f64 / 1024.0;
        MemoryMetrics {
            total_gb,
            used_gb,
            free_gb: self.free_mb as f64 / 1024.0,
            usage_pct: (used_gb / total_gb * 100.0).round(),
        }
    }
}

/// Section of a node's telemetry that failed to parse
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseFailure {
    pub node: NodeId,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub polled: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    pub parse_failures: Vec<ParseFailure>,
    pub skipped: Vec<NodeId>,
}

pub struct TelemetryCollector {
    queries: TelemetryConf,
}

impl TelemetryCollector {
    pub fn new(queries: TelemetryConf) -> Self {
        Self { queries }
    }

    /// Interroge les nœuds connectés parmi `node_ids` (tous par défaut) et
    /// écrit les métriques dans le registre une fois les trois fan-outs joints.
    pub async fn poll(&self, fleet: &mut Fleet, node_ids: Option<&[NodeId]>) -> Result<PollReport> {
        let targets = fleet.registry().resolve(node_ids)?;
        let mut report = PollReport::default();

        let (connected, skipped): (Vec<NodeId>, Vec<NodeId>) =
            targets.into_iter().partition(|id| fleet.pool().is_connected(id));
        report.skipped = skipped;
        if connected.is_empty() {
            debug!("telemetry poll: no connected nodes");
            return Ok(report);
        }

        let gpu = fleet.execute_on(&self.queries.gpu_query, &connected).await;
        let load = fleet.execute_on(&self.queries.load_query, &connected).await;
        let memory = fleet.execute_on(&self.queries.memory_query, &connected).await;

        let now = Utc::now();
        for id in connected {
            let sections = [outcome_of(&gpu, &id), outcome_of(&load, &id), outcome_of(&memory, &id)];
            if sections.iter().any(|o| o.error().is_some_and(|e| e.is_transport())) {
                // statut déjà passé à `error` par l'éviction
                warn!(node = %id, "telemetry transport failure");
                report.failed.push(id);
                continue;
            }
            if sections.iter().any(|o| o.error().is_some()) {
                // session perdue entre deux requêtes
                report.failed.push(id);
                continue;
            }

            let threads = fleet.registry().get(&id)?.cpu.threads;
            let gpu_update = parse_section(&sections[0], GpuRecord::parse, &id, &mut report);
            let cpu_update = parse_section(&sections[1], parse_load_average, &id, &mut report)
                .and_then(|load| cpu_usage_from_load(load, threads));
            let memory_update = parse_section(&sections[2], MemoryReport::parse, &id, &mut report);

            fleet.registry_mut().update(&id, |node| {
                if let Some(record) = gpu_update {
                    node.gpu = Some(record.into_metrics());
                }
                if let Some(usage) = cpu_update {
                    node.cpu.usage_pct = usage;
                }
                if let Some(mem) = memory_update {
                    node.memory = mem.into_metrics();
                }
                node.status = NodeStatus::Online;
                node.last_contact = Some(now);
            })?;
            report.polled.push(id);
        }

        info!(
            polled = report.polled.len(),
            failed = report.failed.len(),
            parse_failures = report.parse_failures.len(),
            skipped = report.skipped.len(),
            "telemetry poll finished"
        );
        Ok(report)
    }
}

fn outcome_of(outcomes: &OutcomeMap, id: &str) -> Outcome {
    outcomes
        .get(id)
        .cloned()
        .unwrap_or(Outcome::Failed(crate::dispatcher::NodeError::NotConnected))
}

/// Empty output is "no sample", not a failure
fn parse_section<T>(
    outcome: &Outcome,
    parser: impl Fn(&str) -> std::result::Result<T, ParseError>,
    node: &str,
    report: &mut PollReport,
) -> Option<T> {
    let text = outcome.output()?;
    if text.trim().is_empty() {
        return None;
    }
    match parser(text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(node, error = %e, "telemetry parse failure, keeping previous value");
            report.parse_failures.push(ParseFailure { node: node.to_string(), error: e.to_string() });
            None
        }
    }
}
