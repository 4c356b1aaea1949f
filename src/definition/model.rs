use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type NodeId = usize;

/// Compiled process graph. Produced by an external parser/compiler and
/// immutable after load; the engine only ever holds it behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: u32,
    pub nodes: Vec<Node>,
    /// Index of the start node.
    #[serde(default)]
    pub start: NodeId,
}

impl ProcessDefinition {
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_named(&self, name: &str) -> Option<(NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, n)| n.name == name)
    }

    /// Looks a task definition up by name across all nodes.
    pub fn task_definition(&self, name: &str) -> Option<&TaskDefinition> {
        self.nodes
            .iter()
            .flat_map(|n| n.tasks.iter())
            .find(|t| t.name == name)
    }
}

/// Closed set of node kinds; the engine dispatches on this by pattern match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Plain,
    Task,
    Fork,
    Join,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub on_enter: Vec<Assignment>,
    #[serde(default)]
    pub on_leave: Vec<Assignment>,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub timers: Vec<TimerDefinition>,
    /// Collection-driven fan-out; only meaningful on fork nodes.
    #[serde(default)]
    pub for_each: Option<ForEach>,
}

impl Node {
    /// The transition taken when a signal names none: the one flagged
    /// default, else the first leaving transition.
    pub fn default_transition(&self) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.default)
            .or_else(|| self.transitions.first())
    }

    pub fn leaving_transition(&self, name: &str) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.name.as_deref() == Some(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub name: Option<String>,
    pub target: NodeId,
    #[serde(default)]
    pub default: bool,
}

/// Enter/leave hook: evaluate an expression and assign the result into the
/// owning token's local scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub variable: String,
    pub expression: String,
}

/// Source of a for-each collection, resolved exactly once per fork call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectionSource {
    /// Literal list of items.
    Items(Vec<Value>),
    /// Either a `${...}` expression resolved through the evaluator, or a
    /// comma-delimited string.
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEach {
    pub collection: CollectionSource,
    /// Variable the iteration value is bound to in each child's local scope.
    pub variable: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    #[serde(default)]
    pub associations: Vec<AssociationDefinition>,
    #[serde(default)]
    pub timers: Vec<TimerDefinition>,
}

impl TaskDefinition {
    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn association(&self, name: &str) -> Option<&AssociationDefinition> {
        self.associations.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(default)]
    pub data_type: PropertyType,
    #[serde(default)]
    pub mandatory: bool,
    /// Protected properties are silently skipped by property writes.
    #[serde(default)]
    pub protected: bool,
    #[serde(default, rename = "default")]
    pub default_value: Option<Value>,
}

/// Fixed internal typing rules. Anything richer (coercion, custom types)
/// belongs to the external dictionary service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Text,
    Int,
    Float,
    Boolean,
    /// RFC 3339 string.
    Date,
    #[default]
    Any,
}

impl PropertyType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            PropertyType::Text => value.is_string(),
            PropertyType::Int => value.is_i64() || value.is_u64(),
            PropertyType::Float => value.is_number(),
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::Date => value
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            PropertyType::Any => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationDefinition {
    pub name: String,
    /// Target cardinality: many wraps values in a list, single unwraps.
    #[serde(default)]
    pub many: bool,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerDefinition {
    pub name: String,
    pub delay: TimerDelay,
    /// Reschedule interval in seconds; the timer fires once when absent.
    #[serde(default)]
    pub repeat_secs: Option<u64>,
    /// Transition signalled when the timer fires; default when absent.
    #[serde(default)]
    pub transition: Option<String>,
}

/// Timer delay: literal seconds, or an expression resolved through the
/// evaluator at scheduling time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimerDelay {
    Seconds(u64),
    Expression(String),
}
