// Provisioning dependency graph / planner integration tests.
//
// Exercises the literal topological-sort, cycle-detection, and
// missing-dependency scenarios end to end through the public `Planner` and
// `DependencyGraph` API, rather than through the crate's own unit tests.

use foghorn::provisioning::{
    AppSpec, DependencyGraph, InfraKind, InfraSpec, InterfaceSpec, Manifest, Phase, PlanScope,
    Planner, ProvisioningTask, PRIVATEER, QUARTERMASTER,
};

fn task(name: &str) -> ProvisioningTask {
    ProvisioningTask::new(name, "svc", "host.local", Phase::Infrastructure)
}

fn infra(name: &str, kind: InfraKind) -> InfraSpec {
    InfraSpec { name: name.to_string(), kind, host: format!("{name}.local"), cluster: None, enabled: true }
}

fn app(name: &str, deploy_type: &str) -> AppSpec {
    AppSpec { name: name.to_string(), deploy_type: deploy_type.to_string(), host: format!("{name}.local"), cluster: None, enabled: true }
}

#[test]
fn topological_three_stage_chain() {
    let mut graph = DependencyGraph::new();
    graph.add_task(task("task-c"), &[]).unwrap();
    graph.add_task(task("task-b"), &["task-c"]).unwrap();
    graph.add_task(task("task-a"), &["task-b"]).unwrap();

    let batches = graph.topological_sort().unwrap();
    assert_eq!(
        batches,
        vec![
            vec!["task-c".to_string()],
            vec!["task-b".to_string()],
            vec!["task-a".to_string()],
        ]
    );
}

#[test]
fn cycle_detection_reports_exact_trace() {
    let mut graph = DependencyGraph::new();
    graph.add_task(task("task-a"), &["task-b"]).unwrap();
    graph.add_task(task("task-b"), &["task-c"]).unwrap();
    graph.add_task(task("task-c"), &["task-a"]).unwrap();

    let err = graph.topological_sort().unwrap_err();
    assert!(
        err.to_string().contains("task-a -> task-b -> task-c -> task-a"),
        "unexpected error message: {err}"
    );
}

#[test]
fn missing_dependency_reports_exact_message() {
    let mut graph = DependencyGraph::new();
    graph.add_task(task("task-a"), &["task-b"]).unwrap();

    let err = graph.validate().unwrap_err();
    assert_eq!(err.to_string(), "fatal: task task-a depends on missing task task-b");
}

#[test]
fn planning_a_manifest_twice_is_idempotent() {
    let manifest = Manifest {
        infrastructure: vec![infra("zk-1", InfraKind::Zookeeper), infra("kafka-1", InfraKind::Kafka)],
        applications: vec![app("qm-1", QUARTERMASTER), app("priv-1", PRIVATEER)],
        interfaces: vec![],
    };

    let first = Planner::plan(&manifest, PlanScope::All).unwrap();
    let second = Planner::plan(&manifest, PlanScope::All).unwrap();
    assert_eq!(first, second);
}

#[test]
fn kafka_depends_on_zookeeper_and_quartermaster_precedes_privateer() {
    let manifest = Manifest {
        infrastructure: vec![infra("kafka-1", InfraKind::Kafka), infra("zk-1", InfraKind::Zookeeper)],
        applications: vec![app("priv-1", PRIVATEER), app("qm-1", QUARTERMASTER)],
        interfaces: vec![],
    };

    let batches = Planner::plan(&manifest, PlanScope::All).unwrap();
    let index_of = |name: &str| {
        batches
            .iter()
            .position(|batch| batch.iter().any(|t| t == name))
            .unwrap_or_else(|| panic!("{name} missing from plan"))
    };

    assert!(index_of("zk-1") < index_of("kafka-1"));
    assert!(index_of("qm-1") < index_of("priv-1"));
}

#[test]
fn unknown_deploy_type_fails_the_plan() {
    let manifest = Manifest {
        infrastructure: vec![],
        applications: vec![app("mystery-1", "not-a-real-role")],
        interfaces: vec![],
    };

    let err = Planner::plan(&manifest, PlanScope::All).unwrap_err();
    assert!(err.to_string().contains("unknown service id"), "unexpected error: {err}");
}

#[test]
fn interfaces_depend_on_every_application() {
    let manifest = Manifest {
        infrastructure: vec![],
        applications: vec![app("svc-1", "service"), app("svc-2", "service")],
        interfaces: vec![InterfaceSpec {
            name: "iface-1".to_string(),
            host: "iface-1.local".to_string(),
            cluster: None,
            enabled: true,
        }],
    };

    let batches = Planner::plan(&manifest, PlanScope::All).unwrap();
    let pos = |n: &str| batches.iter().position(|b| b.iter().any(|t| t == n)).unwrap();
    assert!(pos("svc-1") < pos("iface-1"));
    assert!(pos("svc-2") < pos("iface-1"));
}
