//! End-to-end cycles against the simulated provider.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hostlb_core::{
    ActionStatus, BalancerConfig, InMemoryProvider, Inventory, PlanDiagnostic, ProviderError,
};
use hostlbd::{Balancer, CycleError};
use tokio::sync::watch;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(name)
}

/// Node `a` at 90% memory, `b` at 10%, one 20-unit guest on `a`.
fn two_nodes(b_maintenance: bool) -> Inventory {
    let json = format!(
        r#"{{
            "nodes": [
                {{"id": "a", "memory": {{"total": 100.0, "used": 90.0}}, "cpu": {{"total": 8.0, "used": 1.0}}}},
                {{"id": "b", "maintenance": {b_maintenance}, "memory": {{"total": 100.0, "used": 10.0}}, "cpu": {{"total": 8.0, "used": 1.0}}}}
            ],
            "guests": [
                {{"id": "100", "name": "app", "node": "a",
                  "usage": {{"memory": 20.0, "cpu": 0.5}}, "allocation": {{"memory": 20.0, "cpu": 1.0}}}}
            ]
        }}"#
    );
    Inventory::from_json_str(&json).unwrap()
}

fn config() -> BalancerConfig {
    let mut config = BalancerConfig::default();
    config.execution.poll_interval = "1s".to_string();
    config.execution.backoff_initial = "1s".to_string();
    config.execution.backoff_max = "4s".to_string();
    config.service.interval = "1h".to_string();
    config
}

#[tokio::test(start_paused = true)]
async fn cycle_moves_guest_to_less_loaded_node() {
    let provider = Arc::new(InMemoryProvider::new(two_nodes(false)));
    let balancer = Balancer::new(provider.clone(), config()).unwrap();

    let summary = balancer.run_cycle().await.unwrap();

    assert_eq!(summary.plan.len(), 1);
    let action = &summary.plan.actions[0];
    assert_eq!((action.guest.as_str(), action.source.as_str(), action.target.as_str()), ("100", "a", "b"));

    let report = summary.report.as_ref().unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.outcomes[0].status, ActionStatus::Succeeded);
    assert!(summary.is_success());

    let inventory = provider.inventory();
    assert_eq!(inventory.nodes[0].memory.used, 70.0);
    assert_eq!(inventory.nodes[1].memory.used, 30.0);
    assert_eq!(balancer.cycles_completed(), 1);
    assert!(!balancer.is_running());
}

#[tokio::test]
async fn maintenance_target_yields_empty_plan_with_reason() {
    let provider = Arc::new(InMemoryProvider::new(two_nodes(true)));
    let balancer = Balancer::new(provider.clone(), config()).unwrap();

    let summary = balancer.run_cycle().await.unwrap();

    assert!(summary.plan.is_empty());
    assert!(summary.plan.mentions("no eligible target"));
    assert!(matches!(
        summary.plan.diagnostics[0],
        PlanDiagnostic::NoEligibleTarget { .. }
    ));
    assert_eq!(summary.report.unwrap().attempted(), 0);
    assert_eq!(provider.migrate_calls("100"), 0);
}

#[tokio::test(start_paused = true)]
async fn pressure_cycle_relieves_stalled_node() {
    let inventory = Inventory::from_json_str(
        r#"{
            "nodes": [
                {"id": "a", "memory": {"total": 100.0, "used": 50.0}, "cpu": {"total": 8.0, "used": 1.0},
                 "pressure": {"memory": {"some": 22.0, "full": 6.0, "spikes": 14.0}}},
                {"id": "b", "memory": {"total": 100.0, "used": 30.0}, "cpu": {"total": 8.0, "used": 1.0}},
                {"id": "c", "memory": {"total": 100.0, "used": 40.0}, "cpu": {"total": 8.0, "used": 1.0}}
            ],
            "guests": [
                {"id": "100", "node": "a", "usage": {"memory": 10.0}, "allocation": {"memory": 10.0},
                 "pressure": {"memory": {"some": 35.0}}}
            ]
        }"#,
    )
    .unwrap();
    let provider = Arc::new(InMemoryProvider::new(inventory));
    let config_toml = r#"
[balancing]
mode = "psi"

[balancing.psi.nodes.memory]
pressure_full = 1.0
pressure_some = 10.0
pressure_spikes = 5.0

[execution]
poll_interval = "1s"
"#;
    let config = BalancerConfig::from_toml_str(config_toml).unwrap();
    let balancer = Balancer::new(provider.clone(), config).unwrap();

    let summary = balancer.run_cycle().await.unwrap();

    assert_eq!(summary.plan.len(), 1);
    assert_eq!(summary.plan.actions[0].target, "b");
    assert!(summary.is_success());
    assert_eq!(provider.guest_node("100").as_deref(), Some("b"));
}

#[tokio::test]
async fn dry_run_plans_without_migrating() {
    let provider = Arc::new(InMemoryProvider::new(two_nodes(false)));
    let mut config = config();
    config.execution.dry_run = true;
    let balancer = Balancer::new(provider.clone(), config).unwrap();

    let summary = balancer.run_cycle().await.unwrap();

    assert!(summary.dry_run);
    assert!(summary.report.is_none());
    assert_eq!(summary.plan.len(), 1);
    assert_eq!(provider.migrate_calls("100"), 0);
    assert_eq!(provider.guest_node("100").as_deref(), Some("a"));

    let json = summary.to_json();
    assert_eq!(json["dry_run"], true);
    assert!(json["report"].is_null());
    assert_eq!(json["plan"]["actions"][0]["target"], "b");
}

#[tokio::test(start_paused = true)]
async fn overlapping_cycle_is_refused() {
    let provider = Arc::new(
        InMemoryProvider::new(two_nodes(false)).with_dispatch_delay(Duration::from_secs(5)),
    );
    let balancer = Balancer::new(provider.clone(), config()).unwrap();

    let (first, second) = tokio::join!(balancer.run_cycle(), balancer.run_cycle());

    assert_eq!(first.unwrap().report.unwrap().succeeded, 1);
    assert!(matches!(second, Err(CycleError::AlreadyRunning)));
    assert_eq!(provider.migrate_calls("100"), 1);
}

#[tokio::test]
async fn collection_failure_aborts_cycle_and_releases_guard() {
    let provider = Arc::new(InMemoryProvider::new(two_nodes(false)));
    provider.fail_listing(Some(ProviderError::Network("connection refused".into())));
    let balancer = Balancer::new(provider.clone(), config()).unwrap();

    let err = balancer.run_cycle().await.unwrap_err();
    assert!(matches!(err, CycleError::Collection(_)));
    assert_eq!(err.to_string(), "collection failed: provider unavailable: network error: connection refused");
    assert_eq!(provider.migrate_calls("100"), 0);
    assert_eq!(balancer.cycles_completed(), 0);
    assert!(!balancer.is_running());

    provider.fail_listing(None);
    assert!(balancer.run_cycle().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn partial_failure_is_reported_not_raised() {
    let json = r#"{
        "nodes": [
            {"id": "a", "memory": {"total": 100.0, "used": 90.0}, "cpu": {"total": 8.0, "used": 0.0}},
            {"id": "b", "memory": {"total": 100.0, "used": 0.0}, "cpu": {"total": 8.0, "used": 0.0}},
            {"id": "c", "memory": {"total": 100.0, "used": 0.0}, "cpu": {"total": 8.0, "used": 0.0}}
        ],
        "guests": [
            {"id": "1", "node": "a", "usage": {"memory": 30.0}, "allocation": {"memory": 30.0}},
            {"id": "2", "node": "a", "usage": {"memory": 30.0}, "allocation": {"memory": 30.0}},
            {"id": "3", "node": "a", "usage": {"memory": 30.0}, "allocation": {"memory": 30.0}}
        ]
    }"#;
    let provider = Arc::new(InMemoryProvider::new(Inventory::from_json_str(json).unwrap()));
    provider.fail_guest(
        "1",
        hostlb_core::ScriptedFailure::Dispatch(ProviderError::Conflict("guest locked".into())),
    );
    let balancer = Balancer::new(provider.clone(), config()).unwrap();

    let summary = balancer.run_cycle().await.unwrap();
    let report = summary.report.as_ref().unwrap();

    assert_eq!(summary.plan.len(), 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.outcome("1").unwrap().attempts, 3);
    assert!(!summary.is_success());
}

#[tokio::test(start_paused = true)]
async fn service_runs_on_interval_until_shutdown() {
    let provider = Arc::new(InMemoryProvider::new(two_nodes(false)));
    let mut config = config();
    config.service.delay = Some("10m".to_string());
    let balancer = Arc::new(Balancer::new(provider.clone(), config).unwrap());
    let (tx, rx) = watch::channel(false);

    let service = {
        let balancer = Arc::clone(&balancer);
        tokio::spawn(async move { balancer.run_service(rx).await })
    };

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(balancer.cycles_completed(), 0);

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(balancer.cycles_completed(), 1);
    assert_eq!(provider.guest_node("100").as_deref(), Some("b"));

    tokio::time::sleep(Duration::from_secs(60 * 60)).await;
    assert_eq!(balancer.cycles_completed(), 2);
    // Already balanced: the second cycle planned nothing.
    assert_eq!(provider.migrate_calls("100"), 1);

    tx.send(true).unwrap();
    service.await.unwrap().unwrap();
}

#[tokio::test]
async fn single_shot_service_returns_after_one_cycle() {
    let provider = Arc::new(InMemoryProvider::new(two_nodes(false)));
    let mut config = config();
    config.service.daemon = false;
    let balancer = Balancer::new(provider.clone(), config).unwrap();
    let (_tx, rx) = watch::channel(false);

    balancer.run_service(rx).await.unwrap();
    assert_eq!(balancer.cycles_completed(), 1);
}

#[tokio::test(start_paused = true)]
async fn example_fixtures_plan_within_constraints() {
    let config = BalancerConfig::from_file(&fixture("hostlb.toml")).unwrap();
    assert_eq!(config.execution.concurrency, 2);
    let provider = Arc::new(InMemoryProvider::from_file(&fixture("inventory.json")).unwrap());
    let balancer = Balancer::new(provider.clone(), config).unwrap();

    let summary = balancer.run_cycle().await.unwrap();
    let plan = &summary.plan;

    assert!(!plan.is_empty());
    assert!(plan.deviation_after <= plan.deviation_before);
    assert!(plan.actions.iter().all(|a| a.guest != "104" && a.guest != "202"));
    assert!(
        plan.actions
            .iter()
            .all(|a| !(a.guest == "103" && a.target == "pve2"))
    );
    assert!(summary.is_success());
}
