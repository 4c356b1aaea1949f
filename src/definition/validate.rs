use std::collections::HashSet;
use std::fmt;

use crate::definition::model::{NodeKind, ProcessDefinition};
use crate::error::{Result, WorkflowError};

/// One structural problem found in a definition. Problems are collected and
/// reported as a list, never truncated to the first failure.
#[derive(Debug, Clone)]
pub struct Problem {
    pub node: Option<String>,
    pub message: String,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "[{}] {}", node, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

fn problem(node: Option<&str>, message: impl Into<String>) -> Problem {
    Problem {
        node: node.map(String::from),
        message: message.into(),
    }
}

/// Collects every structural problem in the definition.
pub fn validate(def: &ProcessDefinition) -> Vec<Problem> {
    let mut problems = Vec::new();

    if def.nodes.is_empty() {
        problems.push(problem(None, "definition has no nodes"));
        return problems;
    }
    if def.node(def.start).is_none() {
        problems.push(problem(
            None,
            format!("start index {} is out of range", def.start),
        ));
    }

    let mut node_names = HashSet::new();
    let mut task_names = HashSet::new();

    for node in &def.nodes {
        if !node_names.insert(node.name.as_str()) {
            problems.push(problem(
                Some(&node.name),
                "duplicate node name",
            ));
        }

        for transition in &node.transitions {
            if def.node(transition.target).is_none() {
                let label = transition.name.as_deref().unwrap_or("(unnamed)");
                problems.push(problem(
                    Some(&node.name),
                    format!(
                        "transition '{}' targets missing node {}",
                        label, transition.target
                    ),
                ));
            }
        }

        match node.kind {
            NodeKind::End => {
                if !node.transitions.is_empty() {
                    problems.push(problem(
                        Some(&node.name),
                        "end node must not have leaving transitions",
                    ));
                }
            }
            NodeKind::Fork => {
                if node.transitions.is_empty() {
                    problems.push(problem(
                        Some(&node.name),
                        "fork node has no leaving transitions",
                    ));
                }
            }
            _ => {
                if node.transitions.is_empty() {
                    problems.push(problem(
                        Some(&node.name),
                        "node has no leaving transitions",
                    ));
                }
            }
        }

        if node.for_each.is_some() && node.kind != NodeKind::Fork {
            problems.push(problem(
                Some(&node.name),
                "for_each is only valid on fork nodes",
            ));
        }
        if !node.tasks.is_empty() && node.kind != NodeKind::Task {
            problems.push(problem(
                Some(&node.name),
                "task definitions are only valid on task nodes",
            ));
        }
        if node.kind == NodeKind::Task && node.tasks.is_empty() {
            problems.push(problem(
                Some(&node.name),
                "task node declares no task definitions",
            ));
        }

        for task in &node.tasks {
            if !task_names.insert(task.name.as_str()) {
                problems.push(problem(
                    Some(&node.name),
                    format!("duplicate task definition name '{}'", task.name),
                ));
            }
        }
    }

    problems
}

/// Validates and rejects the definition if any problem was found.
pub fn check(def: &ProcessDefinition) -> Result<()> {
    let problems = validate(def);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::InvalidDefinition {
            id: def.id.clone(),
            problems: problems.iter().map(|p| p.to_string()).collect(),
        })
    }
}
