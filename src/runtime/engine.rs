use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::definition::model::{
    Assignment, CollectionSource, ForEach, Node, NodeKind, ProcessDefinition, TimerDefinition,
    TimerDelay, Transition,
};
use crate::definition::validate;
use crate::error::{Result, WorkflowError};
use crate::runtime::context::EngineContext;
use crate::runtime::evaluator::strip_template;
use crate::runtime::instance::{ProcessInstance, TimerOp, TimerRequest, TokenId};

/// Prefix used when naming children of unnamed fork transitions.
const GENERATED_FORK_PREFIX: &str = "fork";

/// The token-tree transition engine.
///
/// All operations are synchronous and act on a `&mut ProcessInstance`; two
/// signals racing on the same instance are serialized by the enclosing
/// persistence transaction, not by engine-internal locks.
pub struct Engine {
    pub(crate) context: EngineContext,
    definitions: DashMap<String, Arc<ProcessDefinition>>,
}

impl Engine {
    pub fn new(context: EngineContext) -> Self {
        Self {
            context,
            definitions: DashMap::new(),
        }
    }

    /// Validates the definition and makes it available for starting.
    /// Structural problems are reported together, not one at a time.
    pub fn deploy(&self, definition: ProcessDefinition) -> Result<Arc<ProcessDefinition>> {
        validate::check(&definition)?;
        let definition = Arc::new(definition);
        info!(definition = %definition.id, version = definition.version, "deployed definition");
        self.definitions
            .insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    pub fn definition(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.get(id).map(|d| d.clone())
    }

    /// Starts a new instance: the root token is placed on the start node and
    /// the node is entered (hooks, timers, task instantiation).
    pub fn start(
        &self,
        definition_id: &str,
        parameters: HashMap<String, Value>,
    ) -> Result<ProcessInstance> {
        let definition = self
            .definition(definition_id)
            .ok_or_else(|| WorkflowError::UnknownDefinition(definition_id.to_string()))?;
        let mut instance = ProcessInstance::new(definition, parameters);
        info!(instance = %instance.id, definition = %definition_id, "started process instance");
        let root = instance.root;
        self.enter_node(&mut instance, root)?;
        Ok(instance)
    }

    /// Moves the token along the named transition, or the current node's
    /// default when no name is given. Unknown names fail without side
    /// effects.
    pub fn signal(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        transition: Option<&str>,
    ) -> Result<()> {
        let definition = instance.definition.clone();
        let t = instance.token(token)?;
        if t.ended {
            return Err(WorkflowError::TokenEnded(token));
        }
        let node = definition
            .node(t.node)
            .ok_or(WorkflowError::UnknownNode(t.node))?;
        let resolved = match transition {
            Some(name) => node.leaving_transition(name).ok_or_else(|| {
                WorkflowError::InvalidTransition {
                    node: node.name.clone(),
                    transition: name.to_string(),
                }
            })?,
            None => node
                .default_transition()
                .ok_or_else(|| WorkflowError::InvalidTransition {
                    node: node.name.clone(),
                    transition: "(default)".to_string(),
                })?,
        }
        .clone();
        debug!(
            instance = %instance.id,
            token = token.0,
            from = %node.name,
            transition = resolved.name.as_deref().unwrap_or("(unnamed)"),
            "signal"
        );
        self.take_transition(instance, token, &resolved)
    }

    /// Marks the token ended. Ending the root token ends the instance.
    pub fn end_token(&self, instance: &mut ProcessInstance, token: TokenId) -> Result<()> {
        let tok = instance.token_mut(token)?;
        if tok.ended {
            return Ok(());
        }
        tok.ended = true;
        instance.record_timer_op(TimerOp::CancelToken(token));
        if token == instance.root {
            instance.active = false;
            instance.ended_at = Some(Utc::now());
            info!(instance = %instance.id, "process instance ended");
        }
        Ok(())
    }

    /// Ends every active descendant of the token (flagging it implicitly
    /// terminated and cancelling its open tasks), then continues the token
    /// along its current node's default transition. The cascade completes
    /// within the caller's transaction; no partially-cancelled state is
    /// observable outside it.
    pub fn join(&self, instance: &mut ProcessInstance, token: TokenId) -> Result<()> {
        let mut cancelled = 0usize;
        for descendant in instance.descendants(token) {
            if instance.token(descendant)?.ended {
                continue;
            }
            let open: Vec<Uuid> = instance
                .open_tasks_for_token(descendant)
                .iter()
                .map(|t| t.id)
                .collect();
            for task in open {
                self.cancel_task(instance, task)?;
            }
            let tok = instance.token_mut(descendant)?;
            tok.terminated_implicitly = true;
            tok.ended = true;
            instance.record_timer_op(TimerOp::CancelToken(descendant));
            cancelled += 1;
        }
        debug!(instance = %instance.id, token = token.0, cancelled, "joined subtree");
        self.signal(instance, token, None)
    }

    // --- internals ---

    fn take_transition(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        transition: &Transition,
    ) -> Result<()> {
        self.leave_node(instance, token)?;
        instance.token_mut(token)?.node = transition.target;
        self.enter_node(instance, token)
    }

    fn leave_node(&self, instance: &mut ProcessInstance, token: TokenId) -> Result<()> {
        let definition = instance.definition.clone();
        let node_id = instance.token(token)?.node;
        let node = definition
            .node(node_id)
            .ok_or(WorkflowError::UnknownNode(node_id))?;
        self.fire_assignments(instance, token, &node.on_leave)?;
        if !node.timers.is_empty() {
            instance.record_timer_op(TimerOp::CancelToken(token));
        }
        Ok(())
    }

    fn enter_node(&self, instance: &mut ProcessInstance, token: TokenId) -> Result<()> {
        let definition = instance.definition.clone();
        let node_id = instance.token(token)?.node;
        let node = definition
            .node(node_id)
            .ok_or(WorkflowError::UnknownNode(node_id))?;
        self.fire_assignments(instance, token, &node.on_enter)?;
        self.schedule_timers(instance, token, &node.timers, None)?;

        match node.kind {
            NodeKind::Plain => Ok(()),
            NodeKind::Task => {
                for task_def in &node.tasks {
                    self.instantiate_task(instance, token, task_def)?;
                }
                Ok(())
            }
            NodeKind::Fork => self.fork(instance, token, node),
            NodeKind::Join => {
                let parent = instance.token(token)?.parent;
                match parent {
                    Some(parent) => {
                        // The arriving branch is done; cancel whatever it
                        // still owns, then converge on the parent.
                        let open: Vec<Uuid> = instance
                            .open_tasks_for_token(token)
                            .iter()
                            .map(|t| t.id)
                            .collect();
                        for task in open {
                            self.cancel_task(instance, task)?;
                        }
                        instance.token_mut(token)?.ended = true;
                        instance.record_timer_op(TimerOp::CancelToken(token));
                        if instance.token(parent)?.ended {
                            // The parent already converged past this join;
                            // this arrival has nothing left to drive.
                            return Ok(());
                        }
                        instance.token_mut(parent)?.node = node_id;
                        self.join(instance, parent)
                    }
                    // A root token reaching a join has nothing to converge.
                    None => self.signal(instance, token, None),
                }
            }
            NodeKind::End => self.end_token(instance, token),
        }
    }

    /// Static and collection-driven fan-out. One child per leaving
    /// transition, multiplied by the items of the for-each collection when
    /// one is declared; the collection is resolved exactly once per call.
    fn fork(&self, instance: &mut ProcessInstance, token: TokenId, node: &Node) -> Result<()> {
        if node.transitions.is_empty() {
            return Err(WorkflowError::InvalidTransition {
                node: node.name.clone(),
                transition: "(default)".to_string(),
            });
        }
        let items = match &node.for_each {
            Some(for_each) => Some(self.resolve_collection(instance, token, for_each)?),
            None => None,
        };
        let iteration_var = node.for_each.as_ref().map(|f| f.variable.clone());
        let node_id = instance.token(token)?.node;

        let mut spawned: Vec<(TokenId, Transition)> = Vec::new();
        for transition in &node.transitions {
            let bindings: Vec<Option<Value>> = match &items {
                Some(list) => list.iter().cloned().map(Some).collect(),
                None => vec![None],
            };
            for binding in bindings {
                let name = self.child_name(instance, token, transition.name.as_deref())?;
                let child = instance.new_token(name, token, node_id);
                if let (Some(variable), Some(value)) = (&iteration_var, binding) {
                    // The iteration value lives in the child's local scope
                    // only, invisible to siblings and the parent.
                    instance.set_var(child, variable, value)?;
                }
                spawned.push((child, transition.clone()));
            }
        }
        info!(
            instance = %instance.id,
            node = %node.name,
            children = spawned.len(),
            "fork"
        );
        for (child, transition) in spawned {
            // An earlier sibling may have reached a join and cascaded,
            // ending the remaining children; those must not be dispatched.
            if instance.token(child)?.ended {
                continue;
            }
            self.take_transition(instance, child, &transition)?;
        }
        Ok(())
    }

    fn resolve_collection(
        &self,
        instance: &ProcessInstance,
        token: TokenId,
        for_each: &ForEach,
    ) -> Result<Vec<Value>> {
        let items = match &for_each.collection {
            CollectionSource::Items(items) => items.clone(),
            CollectionSource::Text(text) => match strip_template(text) {
                Some(inner) => match instance.get_var(token, inner.trim())? {
                    Some(Value::Array(items)) => items,
                    Some(Value::String(s)) => split_delimited(&s),
                    Some(_) => {
                        return Err(WorkflowError::MalformedCollection(text.clone()));
                    }
                    None => {
                        let scope = instance.get_all_vars(token)?;
                        match self.context.evaluator.evaluate(text, &scope) {
                            Ok(Value::Array(items)) => items,
                            Ok(Value::String(s)) => split_delimited(&s),
                            Ok(_) | Err(_) => {
                                return Err(WorkflowError::MalformedCollection(text.clone()));
                            }
                        }
                    }
                },
                None => split_delimited(text),
            },
        };
        if items.is_empty() {
            return Err(WorkflowError::MalformedCollection(match &for_each.collection {
                CollectionSource::Text(text) => text.clone(),
                CollectionSource::Items(_) => "(literal)".to_string(),
            }));
        }
        Ok(items)
    }

    /// Child token naming. A named transition keeps its name, probing
    /// `name2`, `name3`… when a sibling already took it; unnamed transitions
    /// get the generated prefix with the first unused ordinal.
    fn child_name(
        &self,
        instance: &ProcessInstance,
        parent: TokenId,
        transition: Option<&str>,
    ) -> Result<String> {
        let parent_token = instance.token(parent)?;
        let taken: Vec<&str> = parent_token
            .children
            .iter()
            .filter_map(|c| instance.token(*c).ok())
            .map(|t| t.name.as_str())
            .collect();
        match transition {
            Some(name) => {
                if !taken.contains(&name) {
                    return Ok(name.to_string());
                }
                let mut ordinal = 2;
                loop {
                    let candidate = format!("{}{}", name, ordinal);
                    if !taken.contains(&candidate.as_str()) {
                        return Ok(candidate);
                    }
                    ordinal += 1;
                }
            }
            None => {
                let mut ordinal = 1;
                loop {
                    let candidate = format!("{}{}", GENERATED_FORK_PREFIX, ordinal);
                    if !taken.contains(&candidate.as_str()) {
                        return Ok(candidate);
                    }
                    ordinal += 1;
                }
            }
        }
    }

    fn fire_assignments(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        assignments: &[Assignment],
    ) -> Result<()> {
        for assignment in assignments {
            let scope = instance.get_all_vars(token)?;
            let value = self
                .context
                .evaluator
                .evaluate(&assignment.expression, &scope)?;
            instance.set_var(token, &assignment.variable, value)?;
        }
        Ok(())
    }

    pub(crate) fn schedule_timers(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        timers: &[TimerDefinition],
        task: Option<Uuid>,
    ) -> Result<()> {
        for timer in timers {
            let delay = self.resolve_delay(instance, token, &timer.delay)?;
            let due = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            instance.record_timer_op(TimerOp::Schedule(TimerRequest {
                name: timer.name.clone(),
                token,
                task,
                due,
                repeat_secs: timer.repeat_secs,
                transition: timer.transition.clone(),
            }));
        }
        Ok(())
    }

    fn resolve_delay(
        &self,
        instance: &ProcessInstance,
        token: TokenId,
        delay: &TimerDelay,
    ) -> Result<Duration> {
        match delay {
            TimerDelay::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            TimerDelay::Expression(expression) => {
                let scope = instance.get_all_vars(token)?;
                let value = self.context.evaluator.evaluate(expression, &scope)?;
                let secs = value
                    .as_u64()
                    .or_else(|| value.as_f64().map(|f| f.max(0.0) as u64))
                    .ok_or_else(|| WorkflowError::Evaluation {
                        expression: expression.clone(),
                        reason: format!("expected a number of seconds, got {}", value),
                    })?;
                Ok(Duration::from_secs(secs))
            }
        }
    }
}

fn split_delimited(text: &str) -> Vec<Value> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Value::String(s.to_string()))
        .collect()
}
