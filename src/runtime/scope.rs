use std::collections::HashMap;

use serde_json::Value;

use crate::error::Result;
use crate::runtime::instance::{ProcessInstance, TokenId};

/// Variable scope chain: every token carries a local map and delegates
/// missed reads to its parent.
impl ProcessInstance {
    /// Local lookup, delegating to the parent chain on a miss.
    pub fn get_var(&self, token: TokenId, name: &str) -> Result<Option<Value>> {
        let mut current = Some(token);
        while let Some(id) = current {
            let t = self.token(id)?;
            if let Some(value) = t.variables.get(name) {
                return Ok(Some(value.clone()));
            }
            current = t.parent;
        }
        Ok(None)
    }

    /// Always writes to the token's own local map. Callers that need
    /// process-global visibility must target the root token explicitly.
    pub fn set_var(&mut self, token: TokenId, name: &str, value: Value) -> Result<()> {
        self.token_mut(token)?
            .variables
            .insert(name.to_string(), value);
        Ok(())
    }

    /// Merge walking from the token up to the root. A name captured from a
    /// closer token is never overwritten by an ancestor's value.
    pub fn get_all_vars(&self, token: TokenId) -> Result<HashMap<String, Value>> {
        let mut merged = HashMap::new();
        let mut current = Some(token);
        while let Some(id) = current {
            let t = self.token(id)?;
            for (name, value) in &t.variables {
                merged
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
            current = t.parent;
        }
        Ok(merged)
    }
}
