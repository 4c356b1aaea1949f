use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::model::{NodeId, ProcessDefinition};
use crate::error::{Result, WorkflowError};
use crate::runtime::task::{TaskInstance, TaskState};

/// Arena index of a token. Parent/children links hold ids, never references,
/// so the token tree carries no ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub usize);

/// One cursor of control flow in a running process. Tokens form a tree under
/// forking; only leaf, unended tokens are active.
#[derive(Debug, Clone)]
pub struct Token {
    pub id: TokenId,
    pub name: String,
    pub parent: Option<TokenId>,
    /// Ordered by creation; entries stay after a child ends.
    pub children: Vec<TokenId>,
    pub node: NodeId,
    pub ended: bool,
    /// Set when the token was ended by a join cascade rather than by
    /// reaching an end node.
    pub terminated_implicitly: bool,
    pub variables: HashMap<String, Value>,
}

/// Timer effect recorded by the engine during a signal; the caller drains
/// these and maps them onto the job store inside the same transaction.
#[derive(Debug, Clone)]
pub enum TimerOp {
    Schedule(TimerRequest),
    CancelToken(TokenId),
    CancelTask(Uuid),
}

#[derive(Debug, Clone)]
pub struct TimerRequest {
    pub name: String,
    pub token: TokenId,
    pub task: Option<Uuid>,
    pub due: DateTime<Utc>,
    pub repeat_secs: Option<u64>,
    pub transition: Option<String>,
}

/// One execution of a process definition, rooted at a single token.
#[derive(Debug, Clone)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition: Arc<ProcessDefinition>,
    pub root: TokenId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active: bool,
    /// Parameters supplied when the instance was started; consulted when
    /// deciding whether a task property default applies.
    pub start_parameters: HashMap<String, Value>,
    pub tasks: Vec<TaskInstance>,
    tokens: Vec<Token>,
    timer_ops: Vec<TimerOp>,
}

impl ProcessInstance {
    pub(crate) fn new(
        definition: Arc<ProcessDefinition>,
        start_parameters: HashMap<String, Value>,
    ) -> Self {
        let root = Token {
            id: TokenId(0),
            name: String::new(),
            parent: None,
            children: Vec::new(),
            node: definition.start,
            ended: false,
            terminated_implicitly: false,
            variables: start_parameters.clone(),
        };
        Self {
            id: Uuid::new_v4(),
            definition,
            root: TokenId(0),
            started_at: Utc::now(),
            ended_at: None,
            active: true,
            start_parameters,
            tasks: Vec::new(),
            tokens: vec![root],
            timer_ops: Vec::new(),
        }
    }

    pub fn token(&self, id: TokenId) -> Result<&Token> {
        self.tokens.get(id.0).ok_or(WorkflowError::UnknownToken(id))
    }

    pub fn token_mut(&mut self, id: TokenId) -> Result<&mut Token> {
        self.tokens
            .get_mut(id.0)
            .ok_or(WorkflowError::UnknownToken(id))
    }

    pub fn root_token(&self) -> &Token {
        // The root is created in the constructor and never removed.
        &self.tokens[self.root.0]
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter()
    }

    /// Creates a child token at the given node and links it under its parent.
    pub(crate) fn new_token(&mut self, name: String, parent: TokenId, node: NodeId) -> TokenId {
        let id = TokenId(self.tokens.len());
        self.tokens.push(Token {
            id,
            name,
            parent: Some(parent),
            children: Vec::new(),
            node,
            ended: false,
            terminated_implicitly: false,
            variables: HashMap::new(),
        });
        self.tokens[parent.0].children.push(id);
        id
    }

    /// A token is active when it is unended and has no live children.
    pub fn is_active(&self, id: TokenId) -> bool {
        match self.tokens.get(id.0) {
            Some(token) => {
                !token.ended
                    && token
                        .children
                        .iter()
                        .all(|c| self.tokens[c.0].ended)
            }
            None => false,
        }
    }

    pub fn active_tokens(&self) -> Vec<TokenId> {
        self.tokens
            .iter()
            .filter(|t| self.is_active(t.id))
            .map(|t| t.id)
            .collect()
    }

    /// Depth-first list of all descendants of the given token.
    pub fn descendants(&self, id: TokenId) -> Vec<TokenId> {
        let mut result = Vec::new();
        let mut stack: Vec<TokenId> = match self.tokens.get(id.0) {
            Some(token) => token.children.iter().rev().copied().collect(),
            None => return result,
        };
        while let Some(current) = stack.pop() {
            result.push(current);
            stack.extend(self.tokens[current.0].children.iter().rev().copied());
        }
        result
    }

    pub fn task(&self, id: Uuid) -> Result<&TaskInstance> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or(WorkflowError::UnknownTask(id))
    }

    pub fn task_mut(&mut self, id: Uuid) -> Result<&mut TaskInstance> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(WorkflowError::UnknownTask(id))
    }

    pub fn open_tasks_for_token(&self, token: TokenId) -> Vec<&TaskInstance> {
        self.tasks
            .iter()
            .filter(|t| t.token == token && t.state == TaskState::Open)
            .collect()
    }

    pub(crate) fn record_timer_op(&mut self, op: TimerOp) {
        self.timer_ops.push(op);
    }

    /// Drains the timer effects accumulated since the last drain. The caller
    /// applies them to the job store within the enclosing transaction.
    pub fn drain_timer_ops(&mut self) -> Vec<TimerOp> {
        std::mem::take(&mut self.timer_ops)
    }
}
