use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::definition::model::TaskDefinition;
use crate::error::{Result, WorkflowError};
use crate::runtime::engine::Engine;
use crate::runtime::instance::{ProcessInstance, TimerOp, TokenId};

pub const PROP_TASK_ID: &str = "taskId";
pub const PROP_DESCRIPTION: &str = "description";
pub const PROP_START_DATE: &str = "startDate";
pub const PROP_DUE_DATE: &str = "dueDate";
pub const PROP_COMPLETION_DATE: &str = "completionDate";
pub const PROP_PRIORITY: &str = "priority";
pub const PROP_OWNER: &str = "owner";
pub const PROP_COMMENT: &str = "comment";
pub const ASSOC_POOLED_ACTORS: &str = "pooledActors";

/// Properties in these namespaces belong to the surrounding platform and are
/// never part of the mandatory-completion check.
const RESERVED_NAMESPACE_PREFIXES: [&str; 2] = ["cm:", "sys:"];

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMESPACE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Open,
    Ended,
}

/// A unit of work bound to exactly one token. State moves OPEN -> ENDED once
/// and never back.
#[derive(Debug, Clone)]
pub struct TaskInstance {
    pub id: Uuid,
    pub token: TokenId,
    /// Name of the task definition this instance was created from.
    pub definition: String,
    pub state: TaskState,
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub priority: i64,
    pub owner: Option<String>,
    /// A task carries at most one comment; setting a new one replaces it.
    pub comment: Option<String>,
    pub pooled_actors: Vec<String>,
    /// Generic variable bag local to this task.
    pub variables: HashMap<String, Value>,
    /// While set, ending the owning token is blocked on this task.
    pub blocking: bool,
    /// While set, ending this task signals the owning token.
    pub signalling: bool,
}

impl TaskInstance {
    fn new(token: TokenId, definition: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
            definition: definition.to_string(),
            state: TaskState::Open,
            description: None,
            started_at: Utc::now(),
            due_date: None,
            completed_at: None,
            priority: 2,
            owner: None,
            comment: None,
            pooled_actors: Vec::new(),
            variables: HashMap::new(),
            blocking: false,
            signalling: true,
        }
    }
}

impl Engine {
    /// Creates a task instance for a token entering a task node. Definition
    /// defaults apply only when the property resolves neither from the
    /// token's scope chain nor from the start parameters.
    pub(crate) fn instantiate_task(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        definition: &TaskDefinition,
    ) -> Result<Uuid> {
        let mut task = TaskInstance::new(token, &definition.name);
        for property in &definition.properties {
            let Some(default) = &property.default_value else {
                continue;
            };
            let resolvable = instance.get_var(token, &property.name)?.is_some()
                || instance.start_parameters.contains_key(&property.name);
            if !resolvable {
                task.variables
                    .insert(property.name.clone(), default.clone());
            }
        }
        let id = task.id;
        debug!(instance = %instance.id, task = %id, definition = %definition.name, "created task");
        instance.tasks.push(task);
        self.schedule_timers(instance, token, &definition.timers, Some(id))?;
        Ok(id)
    }

    /// Structured fields merged with scope entries. Scope entries are
    /// restricted to names declared on the task's type as a property or
    /// association, or names set directly on the task's own scope. With
    /// `include_ancestors` false only the task-local scope is consulted.
    pub fn get_task_properties(
        &self,
        instance: &ProcessInstance,
        task: Uuid,
        include_ancestors: bool,
    ) -> Result<HashMap<String, Value>> {
        let t = instance.task(task)?;
        let definition = instance.definition.task_definition(&t.definition);

        let mut scope = if include_ancestors {
            instance.get_all_vars(t.token)?
        } else {
            HashMap::new()
        };
        // Task-local values shadow anything from the token chain.
        for (name, value) in &t.variables {
            scope.insert(name.clone(), value.clone());
        }

        let mut properties = HashMap::new();
        for (name, value) in scope {
            let declared = definition.is_some_and(|d| {
                d.property(&name).is_some() || d.association(&name).is_some()
            });
            if declared || t.variables.contains_key(&name) {
                properties.insert(name, value);
            }
        }

        properties.insert(PROP_TASK_ID.to_string(), json!(t.id.to_string()));
        properties.insert(PROP_PRIORITY.to_string(), json!(t.priority));
        properties.insert(
            PROP_START_DATE.to_string(),
            json!(t.started_at.to_rfc3339()),
        );
        if let Some(description) = &t.description {
            properties.insert(PROP_DESCRIPTION.to_string(), json!(description));
        }
        if let Some(due) = &t.due_date {
            properties.insert(PROP_DUE_DATE.to_string(), json!(due.to_rfc3339()));
        }
        if let Some(completed) = &t.completed_at {
            properties.insert(
                PROP_COMPLETION_DATE.to_string(),
                json!(completed.to_rfc3339()),
            );
        }
        if let Some(owner) = &t.owner {
            properties.insert(PROP_OWNER.to_string(), json!(owner));
        }
        if let Some(comment) = &t.comment {
            properties.insert(PROP_COMMENT.to_string(), json!(comment));
        }

        // Pooled actors surface as resolved directory entries; unresolvable
        // identifiers are skipped.
        let pooled: Vec<Value> = t
            .pooled_actors
            .iter()
            .filter_map(|actor| self.context.identities.resolve(actor))
            .map(|entry| json!({ "id": entry.id, "displayName": entry.display_name }))
            .collect();
        if !pooled.is_empty() {
            properties.insert(ASSOC_POOLED_ACTORS.to_string(), Value::Array(pooled));
        }

        Ok(properties)
    }

    /// Applies property writes to an open task. Protected declared
    /// properties are skipped silently; fixed structured fields are type
    /// checked; declared associations are wrapped per cardinality; anything
    /// else lands in the task's local variable bag.
    pub fn set_task_properties(
        &self,
        instance: &mut ProcessInstance,
        task: Uuid,
        properties: &HashMap<String, Value>,
    ) -> Result<()> {
        let definition = {
            let t = instance.task(task)?;
            if t.state == TaskState::Ended {
                return Err(WorkflowError::TaskEnded(task));
            }
            instance.definition.task_definition(&t.definition).cloned()
        };

        for (name, value) in properties {
            let property_def = definition.as_ref().and_then(|d| d.property(name));
            if property_def.is_some_and(|p| p.protected) {
                // Only non-protected properties are written; no error.
                debug!(task = %task, property = %name, "skipped protected property");
                continue;
            }

            let t = instance.task_mut(task)?;
            match name.as_str() {
                PROP_DESCRIPTION => {
                    t.description = Some(expect_string(name, value)?);
                }
                PROP_DUE_DATE => {
                    t.due_date = Some(expect_date(name, value)?);
                }
                PROP_PRIORITY => {
                    t.priority = value.as_i64().ok_or_else(|| invalid(name, value))?;
                }
                PROP_COMMENT => {
                    // Replaces the previous comment rather than appending.
                    t.comment = Some(expect_string(name, value)?);
                }
                PROP_OWNER => {
                    let owner = expect_string(name, value)?;
                    if t.owner.as_deref() != Some(owner.as_str()) {
                        t.owner = Some(owner);
                    }
                }
                ASSOC_POOLED_ACTORS => {
                    t.pooled_actors = expect_string_list(name, value)?;
                }
                _ => {
                    if let Some(assoc) = definition.as_ref().and_then(|d| d.association(name)) {
                        let wrapped = wrap_association(name, value, assoc.many)?;
                        t.variables.insert(name.clone(), wrapped);
                    } else if let Some(property) = property_def {
                        if !property.data_type.matches(value) {
                            return Err(invalid(name, value));
                        }
                        t.variables.insert(name.clone(), value.clone());
                    } else {
                        // No mapping established: generic task-local value.
                        t.variables.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Association diffing with set semantics: adds append targets not
    /// already present (promoting a scalar to a one-element list); removes
    /// delete exactly the listed targets. Removing from an absent key is a
    /// no-op.
    pub fn update_task_associations(
        &self,
        instance: &mut ProcessInstance,
        task: Uuid,
        adds: &HashMap<String, Vec<Value>>,
        removes: &HashMap<String, Vec<Value>>,
    ) -> Result<()> {
        {
            let t = instance.task(task)?;
            if t.state == TaskState::Ended {
                return Err(WorkflowError::TaskEnded(task));
            }
        }
        // Values computed earlier in this same call take precedence over the
        // task's own scope.
        let mut pending: HashMap<String, Value> = HashMap::new();

        for (key, targets) in adds {
            let existing = pending
                .get(key)
                .cloned()
                .or_else(|| instance.task(task).ok()?.variables.get(key).cloned());
            let mut list = match existing {
                None => Vec::new(),
                Some(Value::Array(items)) => items,
                Some(scalar) => vec![scalar],
            };
            for target in targets {
                if !list.contains(target) {
                    list.push(target.clone());
                }
            }
            pending.insert(key.clone(), Value::Array(list));
        }

        for (key, targets) in removes {
            let existing = pending
                .get(key)
                .cloned()
                .or_else(|| instance.task(task).ok()?.variables.get(key).cloned());
            match existing {
                Some(Value::Array(items)) => {
                    let remaining: Vec<Value> = items
                        .into_iter()
                        .filter(|item| !targets.contains(item))
                        .collect();
                    pending.insert(key.clone(), Value::Array(remaining));
                }
                Some(scalar) if targets.contains(&scalar) => {
                    pending.insert(key.clone(), Value::Array(Vec::new()));
                }
                // Absent key, or a scalar no target matches: no-op.
                _ => {}
            }
        }

        let t = instance.task_mut(task)?;
        for (key, value) in pending {
            t.variables.insert(key, value);
        }
        Ok(())
    }

    /// Completes the task: every declared mandatory property/association
    /// outside the reserved namespaces must carry a non-empty value, then the
    /// owning token is signalled and the task ends. ENDED is terminal.
    pub fn complete_task(
        &self,
        instance: &mut ProcessInstance,
        task: Uuid,
        transition: Option<&str>,
    ) -> Result<()> {
        let (token, definition) = {
            let t = instance.task(task)?;
            if t.state == TaskState::Ended {
                return Err(WorkflowError::TaskEnded(task));
            }
            (
                t.token,
                instance.definition.task_definition(&t.definition).cloned(),
            )
        };

        if let Some(definition) = &definition {
            let current = self.get_task_properties(instance, task, true)?;
            let mut missing = Vec::new();
            for property in &definition.properties {
                if property.mandatory && !is_reserved(&property.name) {
                    if is_missing(current.get(&property.name)) {
                        missing.push(property.name.clone());
                    }
                }
            }
            for association in &definition.associations {
                if association.mandatory && !is_reserved(&association.name) {
                    if is_missing(current.get(&association.name)) {
                        missing.push(association.name.clone());
                    }
                }
            }
            if !missing.is_empty() {
                return Err(WorkflowError::MissingMandatoryProperties(missing));
            }
        }

        // Reject an invalid transition before the task is marked ended.
        {
            let t = instance.token(token)?;
            let node = instance
                .definition
                .node(t.node)
                .ok_or(WorkflowError::UnknownNode(t.node))?;
            if let Some(name) = transition {
                if node.leaving_transition(name).is_none() {
                    return Err(WorkflowError::InvalidTransition {
                        node: node.name.clone(),
                        transition: name.to_string(),
                    });
                }
            }
        }

        {
            let t = instance.task_mut(task)?;
            t.state = TaskState::Ended;
            t.completed_at = Some(Utc::now());
            t.signalling = false;
        }
        instance.record_timer_op(TimerOp::CancelTask(task));
        debug!(instance = %instance.id, task = %task, "completed task");
        self.signal(instance, token, transition)
    }

    /// Join cancellation path: blocking and re-entrant-signal flags are
    /// cleared before the state flips, so the cancellation itself can never
    /// re-trigger a transition.
    pub(crate) fn cancel_task(&self, instance: &mut ProcessInstance, task: Uuid) -> Result<()> {
        let t = instance.task_mut(task)?;
        if t.state == TaskState::Ended {
            return Ok(());
        }
        t.blocking = false;
        t.signalling = false;
        t.state = TaskState::Ended;
        t.completed_at = Some(Utc::now());
        instance.record_timer_op(TimerOp::CancelTask(task));
        debug!(instance = %instance.id, task = %task, "cancelled task");
        Ok(())
    }
}

fn invalid(name: &str, value: &Value) -> WorkflowError {
    WorkflowError::InvalidPropertyValue {
        name: name.to_string(),
        value: value.clone(),
    }
}

fn expect_string(name: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(String::from)
        .ok_or_else(|| invalid(name, value))
}

fn expect_date(name: &str, value: &Value) -> Result<DateTime<Utc>> {
    let text = value.as_str().ok_or_else(|| invalid(name, value))?;
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| invalid(name, value))
}

fn expect_string_list(name: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| expect_string(name, item))
            .collect(),
        _ => Err(invalid(name, value)),
    }
}

/// Wraps an association value per its declared cardinality.
fn wrap_association(name: &str, value: &Value, many: bool) -> Result<Value> {
    if many {
        match value {
            Value::Array(_) => Ok(value.clone()),
            scalar => Ok(Value::Array(vec![scalar.clone()])),
        }
    } else {
        match value {
            Value::Array(items) if items.len() == 1 => Ok(items[0].clone()),
            Value::Array(_) => Err(invalid(name, value)),
            scalar => Ok(scalar.clone()),
        }
    }
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}
