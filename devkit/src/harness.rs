/*!
Test Harness pour la flotte Symbion

Facilite l'écriture de tests de bout en bout avec:
- Config réduite (N nœuds `n1..nN`, adresses `10.0.0.N`, timeouts courts)
- Transport mock partagé entre le test et la flotte
- Échantillons de télémétrie au format des vraies commandes
*/

use crate::mock_transport::{MockReply, MockTransport};
use anyhow::Result;
use std::sync::Arc;
use symbion_fleet::config::{FleetConfig, GPU_QUERY, LOAD_QUERY, MEMORY_QUERY};
use symbion_fleet::{Fleet, StaticKeyStore};

pub struct FleetHarness {
    pub transport: MockTransport,
    pub config: FleetConfig,
}

impl FleetHarness {
    pub fn new(size: usize) -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        let mut config = FleetConfig::default();
        config.fleet.size = size;
        config.fleet.id_template = "n{n}".into();
        config.fleet.address_template = "10.0.0.{n}".into();
        config.ssh.private_key = Some("/keys/fleet".into());
        config.ssh.connect_timeout_secs = 2;
        config.dispatch.command_timeout_secs = 2;
        config.dispatch.max_concurrency = 8;

        Self { transport: MockTransport::new(), config }
    }

    pub fn with_id_template(mut self, template: &str) -> Self {
        self.config.fleet.id_template = template.into();
        self
    }

    pub fn with_command_timeout(mut self, secs: u64) -> Self {
        self.config.dispatch.command_timeout_secs = secs;
        self
    }

    pub fn fleet(&self) -> Result<Fleet> {
        let credentials = StaticKeyStore::from_ssh_conf(&self.config.ssh);
        let fleet = Fleet::new(&self.config, Arc::new(self.transport.clone()), Arc::new(credentials))?;
        Ok(fleet)
    }

    /// Flotte avec `connect_all` déjà passé
    pub async fn connected_fleet(&self) -> Result<Fleet> {
        let mut fleet = self.fleet()?;
        fleet.connect_all().await;
        Ok(fleet)
    }

    /// Scripte les trois requêtes de télémétrie d'un nœud
    pub fn script_telemetry(&self, node_id: &str, sample: &TelemetrySample) -> &Self {
        self.transport
            .respond(node_id, GPU_QUERY, MockReply::stdout(sample.gpu_line()))
            .respond(node_id, LOAD_QUERY, MockReply::stdout(sample.loadavg_line()))
            .respond(node_id, MEMORY_QUERY, MockReply::stdout(sample.free_output()));
        self
    }
}

/// Valeurs d'un nœud sain, rendues comme `nvidia-smi`, `/proc/loadavg` et `free -m`
#[derive(Debug, Clone)]
pub struct TelemetrySample {
    pub gpu_model: String,
    pub vram_mb: u64,
    pub gpu_temp: f64,
    pub gpu_util: f64,
    pub power_w: f64,
    pub load: f64,
    pub mem_total_mb: u64,
    pub mem_used_mb: u64,
}

impl Default for TelemetrySample {
    fn default() -> Self {
        Self {
            gpu_model: "NVIDIA GeForce RTX 5090".into(),
            vram_mb: 32768,
            gpu_temp: 65.0,
            gpu_util: 80.0,
            power_w: 410.5,
            load: 8.0,
            mem_total_mb: 65536,
            mem_used_mb: 16384,
        }
    }
}

impl TelemetrySample {
    pub fn gpu(mut self, temp: f64, util: f64) -> Self {
        self.gpu_temp = temp;
        self.gpu_util = util;
        self
    }

    pub fn load(mut self, load: f64) -> Self {
        self.load = load;
        self
    }

    pub fn gpu_line(&self) -> String {
        format!(
            "0, {}, {}, 1024, {}, {}, {}\n",
            self.gpu_model, self.vram_mb, self.gpu_temp, self.gpu_util, self.power_w
        )
    }

    pub fn loadavg_line(&self) -> String {
        format!("{:.2} 7.50 7.10 3/1520 48211\n", self.load)
    }

    pub fn free_output(&self) -> String {
        let free = self.mem_total_mb.saturating_sub(self.mem_used_mb);
        format!(
            "               total        used        free      shared  buff/cache   available\n\
             Mem:   {:>12} {:>11} {:>11}         512        4096       {}\n\
             Swap:          8191           0        8191\n",
            self.mem_total_mb, self.mem_used_mb, free, free
        )
    }
}
