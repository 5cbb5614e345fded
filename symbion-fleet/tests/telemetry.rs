use symbion_devkit::{FleetHarness, MockReply, TelemetrySample};
use symbion_fleet::config::{GPU_QUERY, MEMORY_QUERY};
use symbion_fleet::{FleetError, NodeStatus, TelemetryCollector};

fn collector(harness: &FleetHarness) -> TelemetryCollector {
    TelemetryCollector::new(harness.config.telemetry.clone())
}

#[tokio::test]
async fn test_poll_writes_parsed_metrics() {
    let harness = FleetHarness::new(2);
    harness.script_telemetry("n1", &TelemetrySample::default().gpu(60.0, 90.0).load(8.0));
    harness.script_telemetry("n2", &TelemetrySample::default().gpu(70.0, 50.0).load(40.0));
    let mut fleet = harness.connected_fleet().await.unwrap();

    let report = collector(&harness).poll(&mut fleet, None).await.unwrap();
    assert_eq!(report.polled, vec!["n1", "n2"]);
    assert!(report.failed.is_empty());
    assert!(report.parse_failures.is_empty());

    let n1 = fleet.registry().get("n1").unwrap();
    let gpu = n1.gpu.as_ref().unwrap();
    assert_eq!(gpu.model, "NVIDIA GeForce RTX 5090");
    assert_eq!(gpu.memory_mb, 32768);
    assert_eq!(gpu.temperature_c, 60.0);
    assert_eq!(n1.cpu.usage_pct, 25.0);
    assert_eq!(n1.memory.total_gb, 64.0);
    assert_eq!(n1.memory.used_gb, 16.0);
    assert_eq!(n1.memory.usage_pct, 25.0);

    // charge au-delà du nombre de threads : pas de plafond
    assert_eq!(fleet.registry().get("n2").unwrap().cpu.usage_pct, 125.0);

    let snap = fleet.snapshot().unwrap();
    assert_eq!(snap.averages.avg_gpu_temp, 65.0);
    assert_eq!(snap.averages.avg_gpu_util, 70.0);
    assert_eq!(snap.totals.total_gpus, 2);
    assert_eq!(snap.totals.total_vram_gb, 64.0);
}

#[tokio::test]
async fn test_short_gpu_line_keeps_previous_sample() {
    let harness = FleetHarness::new(1);
    harness.script_telemetry("n1", &TelemetrySample::default().gpu(61.0, 40.0));
    let mut fleet = harness.connected_fleet().await.unwrap();
    let collector = collector(&harness);
    collector.poll(&mut fleet, None).await.unwrap();

    harness
        .transport
        .respond("n1", GPU_QUERY, MockReply::stdout("0, RTX 5090, 32607\n"));
    let report = collector.poll(&mut fleet, None).await.unwrap();

    assert_eq!(report.polled, vec!["n1"]);
    assert_eq!(report.parse_failures.len(), 1);
    assert_eq!(report.parse_failures[0].node, "n1");
    assert!(report.parse_failures[0].error.contains("expected 7 fields, found 3"));

    let n1 = fleet.registry().get("n1").unwrap();
    assert_eq!(n1.gpu.as_ref().unwrap().temperature_c, 61.0);
    assert_eq!(n1.status, NodeStatus::Online);
}

#[tokio::test]
async fn test_short_gpu_line_does_not_stop_other_nodes() {
    let harness = FleetHarness::new(2);
    harness.script_telemetry("n1", &TelemetrySample::default().gpu(61.0, 40.0));
    harness.script_telemetry("n2", &TelemetrySample::default().gpu(55.0, 20.0));
    let mut fleet = harness.connected_fleet().await.unwrap();
    let collector = collector(&harness);
    collector.poll(&mut fleet, None).await.unwrap();
    harness.transport.clear_log();

    harness
        .transport
        .respond("n1", GPU_QUERY, MockReply::stdout("0, RTX 5090, 32607, 48\n"));
    harness.script_telemetry("n2", &TelemetrySample::default().gpu(72.0, 95.0));
    let report = collector.poll(&mut fleet, None).await.unwrap();

    assert_eq!(report.polled, vec!["n1", "n2"]);
    assert_eq!(report.parse_failures.len(), 1);
    assert_eq!(report.parse_failures[0].node, "n1");
    assert_eq!(harness.transport.executed_on("n2").len(), 3);

    let n1 = fleet.registry().get("n1").unwrap();
    assert_eq!(n1.gpu.as_ref().unwrap().temperature_c, 61.0);
    assert_eq!(n1.gpu.as_ref().unwrap().utilization_pct, 40.0);
    let n2 = fleet.registry().get("n2").unwrap();
    assert_eq!(n2.gpu.as_ref().unwrap().temperature_c, 72.0);
    assert_eq!(n2.gpu.as_ref().unwrap().utilization_pct, 95.0);
}

#[tokio::test]
async fn test_malformed_memory_does_not_touch_gpu() {
    let harness = FleetHarness::new(1);
    harness.script_telemetry("n1", &TelemetrySample::default());
    harness
        .transport
        .respond("n1", MEMORY_QUERY, MockReply::stdout("free: command not found\n"));
    let mut fleet = harness.connected_fleet().await.unwrap();
    let before = fleet.registry().get("n1").unwrap().memory.clone();

    let report = collector(&harness).poll(&mut fleet, None).await.unwrap();
    assert_eq!(report.parse_failures.len(), 1);
    let n1 = fleet.registry().get("n1").unwrap();
    assert_eq!(n1.memory, before);
    assert!(n1.gpu.is_some());
}

#[tokio::test]
async fn test_unconnected_nodes_are_skipped() {
    let harness = FleetHarness::new(3);
    harness.transport.refuse("n3", "No route to host");
    harness.script_telemetry("n1", &TelemetrySample::default());
    harness.script_telemetry("n2", &TelemetrySample::default());
    let mut fleet = harness.connected_fleet().await.unwrap();

    let report = collector(&harness).poll(&mut fleet, None).await.unwrap();
    assert_eq!(report.skipped, vec!["n3"]);
    assert!(harness.transport.executed_on("n3").is_empty());
    assert!(fleet.registry().get("n3").unwrap().gpu.is_none());
}

#[tokio::test]
async fn test_transport_failure_during_poll() {
    let harness = FleetHarness::new(2);
    harness.script_telemetry("n1", &TelemetrySample::default());
    let mut fleet = harness.connected_fleet().await.unwrap();
    harness.transport.break_session("n2", "Broken pipe");

    let report = collector(&harness).poll(&mut fleet, None).await.unwrap();
    assert_eq!(report.polled, vec!["n1"]);
    assert_eq!(report.failed, vec!["n2"]);
    assert_eq!(fleet.registry().get("n2").unwrap().status, NodeStatus::Error);

    // n2 évincé dès la requête GPU, les deux suivantes ne l'atteignent pas
    assert_eq!(harness.transport.executed_on("n2").len(), 1);
}

#[tokio::test]
async fn test_snapshot_without_online_nodes() {
    let harness = FleetHarness::new(2);
    let fleet = harness.fleet().unwrap();

    assert!(matches!(fleet.snapshot(), Err(FleetError::NoOnlineNodes)));
    let totals = symbion_fleet::aggregator::totals(fleet.registry());
    assert_eq!(totals.total_nodes, 2);
    assert_eq!(totals.online_nodes, 0);
    assert_eq!(totals.total_cores, 48);
}
