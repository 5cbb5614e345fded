//! Fleet-wide statistics, recomputed from the registry on every call
//!
//! Totals cover every registered node regardless of status. Averages cover
//! online nodes only and are an error when none is online.

use crate::error::{FleetError, Result};
use crate::registry::NodeRegistry;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetTotals {
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub total_gpus: usize,
    pub total_vram_gb: f64,
    pub total_ram_gb: f64,
    pub total_cores: u64,
    pub total_earnings: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetAverages {
    pub avg_gpu_temp: f64,
    pub avg_gpu_util: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSnapshot {
    #[serde(flatten)]
    pub totals: FleetTotals,
    #[serde(flatten)]
    pub averages: FleetAverages,
}

pub fn totals(registry: &NodeRegistry) -> FleetTotals {
    let nodes = registry.all();
    FleetTotals {
        total_nodes: nodes.len(),
        online_nodes: nodes.iter().filter(|n| n.is_online()).count(),
        total_gpus: nodes.iter().filter(|n| n.gpu.is_some()).count(),
        total_vram_gb: nodes
            .iter()
            .filter_map(|n| n.gpu.as_ref())
            .map(|g| g.memory_mb as f64 / 1024.0)
            .sum(),
        total_ram_gb: nodes.iter().map(|n| n.memory.total_gb).sum(),
        total_cores: nodes.iter().map(|n| n.cpu.cores as u64).sum(),
        total_earnings: nodes.iter().map(|n| n.earnings).sum(),
    }
}

/// Un nœud online sans échantillon GPU compte pour 0
pub fn averages(registry: &NodeRegistry) -> Result<FleetAverages> {
    let online: Vec<_> = registry.all().iter().filter(|n| n.is_online()).collect();
    if online.is_empty() {
        return Err(FleetError::NoOnlineNodes);
    }
    let count = online.len() as f64;
    let temp: f64 = online.iter().map(|n| n.gpu.as_ref().map_or(0.0, |g| g.temperature_c)).sum();
    let util: f64 = online.iter().map(|n| n.gpu.as_ref().map_or(0.0, |g| g.utilization_pct)).sum();
    Ok(FleetAverages {
        avg_gpu_temp: temp / count,
        avg_gpu_util: util / count,
    })
}

pub fn summarize(registry: &NodeRegistry) -> Result<FleetSnapshot> {
    Ok(FleetSnapshot {
        averages: averages(registry)?,
        totals: totals(registry),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileConf;
    use crate::models::{GpuMetrics, NodeStatus};

    fn gpu(temp: f64, util: f64) -> GpuMetrics {
        GpuMetrics {
            index: 0,
            model: "RTX 5090".into(),
            memory_mb: 32768,
            temperature_c: temp,
            utilization_pct: util,
            power_draw_w: 300.0,
        }
    }

    fn registry() -> NodeRegistry {
        let mut reg = NodeRegistry::initialize(3, "n{n}", "10.0.0.{n}", &ProfileConf::default()).unwrap();
        reg.update("n1", |n| {
            n.status = NodeStatus::Online;
            n.gpu = Some(gpu(60.0, 80.0));
        })
        .unwrap();
        reg.update("n2", |n| {
            n.status = NodeStatus::Offline;
            n.gpu = Some(gpu(90.0, 10.0));
        })
        .unwrap();
        reg.update("n3", |n| {
            n.status = NodeStatus::Online;
            n.gpu = Some(gpu(70.0, 60.0));
        })
        .unwrap();
        reg.credit_earnings("n2", 10.0).unwrap();
        reg.credit_earnings("n3", 5.5).unwrap();
        reg
    }

    #[test]
    fn test_averages_only_online() {
        let snap = summarize(&registry()).unwrap();
        assert_eq!(snap.averages.avg_gpu_temp, 65.0);
        assert_eq!(snap.averages.avg_gpu_util, 70.0);
        assert_eq!(snap.totals.online_nodes, 2);
    }

    #[test]
    fn test_totals_ignore_status() {
        let mut reg = registry();
        let before = totals(&reg);
        for id in reg.ids() {
            reg.update(&id, |n| n.status = NodeStatus::Error).unwrap();
        }
        let after = totals(&reg);
        assert_eq!(before.total_vram_gb, after.total_vram_gb);
        assert_eq!(before.total_ram_gb, after.total_ram_gb);
        assert_eq!(before.total_cores, after.total_cores);
        assert_eq!(before.total_earnings, after.total_earnings);
        assert_eq!(after.total_vram_gb, 96.0);
        assert_eq!(after.total_ram_gb, 192.0);
        assert_eq!(after.total_cores, 72);
        assert_eq!(after.total_earnings, 15.5);
    }

    #[test]
    fn test_no_online_nodes_is_an_error() {
        let reg = NodeRegistry::initialize(2, "n{n}", "10.0.0.{n}", &ProfileConf::default()).unwrap();
        assert!(matches!(summarize(&reg), Err(FleetError::NoOnlineNodes)));
        assert!(matches!(averages(&reg), Err(FleetError::NoOnlineNodes)));
        assert_eq!(totals(&reg).total_nodes, 2);
    }

    #[test]
    fn test_online_node_without_gpu_counts_as_zero() {
        let mut reg = NodeRegistry::initialize(2, "n{n}", "10.0.0.{n}", &ProfileConf::default()).unwrap();
        reg.update("n1", |n| {
            n.status = NodeStatus::Online;
            n.gpu = Some(gpu(80.0, 50.0));
        })
        .unwrap();
        reg.update("n2", |n| n.status = NodeStatus::Online).unwrap();
        let avg = averages(&reg).unwrap();
        assert_eq!(avg.avg_gpu_temp, 40.0);
        assert_eq!(avg.avg_gpu_util, 25.0);
    }
}
