use std::collections::HashMap;

use procflow::definition::model::{
    Assignment, Node, NodeKind, ProcessDefinition, TaskDefinition, Transition,
};
use procflow::runtime::context::EngineContext;
use procflow::runtime::engine::Engine;
use procflow::runtime::task::TaskState;
use procflow::WorkflowError;
use serde_json::json;

fn node(name: &str, kind: NodeKind) -> Node {
    Node {
        name: name.to_string(),
        kind,
        transitions: Vec::new(),
        on_enter: Vec::new(),
        on_leave: Vec::new(),
        tasks: Vec::new(),
        timers: Vec::new(),
        for_each: None,
    }
}

fn transition(name: Option<&str>, target: usize) -> Transition {
    Transition {
        name: name.map(String::from),
        target,
        default: false,
    }
}

fn task_def(name: &str) -> TaskDefinition {
    TaskDefinition {
        name: name.to_string(),
        properties: Vec::new(),
        associations: Vec::new(),
        timers: Vec::new(),
    }
}

fn definition(id: &str, nodes: Vec<Node>) -> ProcessDefinition {
    ProcessDefinition {
        id: id.to_string(),
        name: id.to_string(),
        version: 1,
        nodes,
        start: 0,
    }
}

/// S --(task T1)--> "go" --> N --(task T2)--> default --> end
fn two_task_definition() -> ProcessDefinition {
    let mut start = node("S", NodeKind::Task);
    start.tasks.push(task_def("T1"));
    start.transitions.push(transition(Some("go"), 1));

    let mut middle = node("N", NodeKind::Task);
    middle.tasks.push(task_def("T2"));
    middle.transitions.push(transition(None, 2));

    let end = node("done", NodeKind::End);
    definition("two-task", vec![start, middle, end])
}

#[test]
fn start_to_end_through_two_tasks() {
    let engine = Engine::new(EngineContext::default());
    engine.deploy(two_task_definition()).expect("deploy failed");

    let mut instance = engine.start("two-task", HashMap::new()).expect("start failed");
    let open: Vec<_> = instance
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Open)
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].definition, "T1");
    let t1 = open[0].id;

    engine
        .complete_task(&mut instance, t1, Some("go"))
        .expect("completing T1 failed");
    let open: Vec<_> = instance
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Open)
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].definition, "T2");
    let t2 = open[0].id;

    engine
        .complete_task(&mut instance, t2, None)
        .expect("completing T2 failed");
    assert!(instance.root_token().ended);
    assert!(!instance.active);
    assert!(instance.ended_at.is_some());
}

#[test]
fn unknown_transition_is_rejected_without_moving() {
    let engine = Engine::new(EngineContext::default());
    engine.deploy(two_task_definition()).expect("deploy failed");
    let mut instance = engine.start("two-task", HashMap::new()).expect("start failed");

    let root = instance.root;
    let before = instance.token(root).expect("root").node;
    let err = engine
        .signal(&mut instance, root, Some("sideways"))
        .expect_err("signal should fail");
    assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    assert!(err.is_validation());
    assert_eq!(instance.token(root).expect("root").node, before);
}

#[test]
fn signalling_an_ended_token_fails() {
    let engine = Engine::new(EngineContext::default());
    engine.deploy(two_task_definition()).expect("deploy failed");
    let mut instance = engine.start("two-task", HashMap::new()).expect("start failed");
    let root = instance.root;

    engine.end_token(&mut instance, root).expect("end failed");
    let err = engine
        .signal(&mut instance, root, None)
        .expect_err("signal should fail");
    assert!(matches!(err, WorkflowError::TokenEnded(_)));
}

#[test]
fn start_parameters_land_in_root_scope() {
    let engine = Engine::new(EngineContext::default());
    engine.deploy(two_task_definition()).expect("deploy failed");

    let mut params = HashMap::new();
    params.insert("initiator".to_string(), json!("alice"));
    let instance = engine.start("two-task", params).expect("start failed");

    assert_eq!(
        instance.get_var(instance.root, "initiator").expect("get"),
        Some(json!("alice"))
    );
    assert_eq!(instance.get_var(instance.root, "missing").expect("get"), None);
}

#[test]
fn enter_hooks_assign_into_local_scope() {
    let mut start = node("S", NodeKind::Plain);
    start.on_enter.push(Assignment {
        variable: "score".to_string(),
        expression: "2 * 21".to_string(),
    });
    start.transitions.push(transition(None, 1));
    let end = node("done", NodeKind::End);

    let engine = Engine::new(EngineContext::default());
    engine
        .deploy(definition("hooked", vec![start, end]))
        .expect("deploy failed");
    let instance = engine.start("hooked", HashMap::new()).expect("start failed");

    assert_eq!(
        instance.get_var(instance.root, "score").expect("get"),
        Some(json!(42))
    );
}

#[test]
fn deploy_collects_every_structural_problem() {
    // Duplicate node names, a dangling transition and a decorated end node
    // must all be reported together.
    let mut first = node("dup", NodeKind::Plain);
    first.transitions.push(transition(None, 9));
    let mut second = node("dup", NodeKind::End);
    second.transitions.push(transition(None, 0));

    let engine = Engine::new(EngineContext::default());
    let err = engine
        .deploy(definition("broken", vec![first, second]))
        .expect_err("deploy should fail");
    match err {
        WorkflowError::InvalidDefinition { id, problems } => {
            assert_eq!(id, "broken");
            assert!(problems.len() >= 3, "expected >= 3 problems, got {problems:?}");
        }
        other => panic!("unexpected error: {other}"),
    }
}
