use dashmap::DashMap;

use crate::error::Result;

/// Resolved directory entry for an opaque actor/group identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRef {
    pub id: String,
    pub display_name: String,
}

/// External collaborator mapping actor identifiers to directory entries.
/// Inside the core identities stay plain strings; resolution only happens
/// when assembling externally visible pooled-actor lists.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, actor: &str) -> Option<IdentityRef>;
}

#[derive(Debug, Default)]
pub struct InMemoryIdentityResolver {
    entries: DashMap<String, IdentityRef>,
}

impl InMemoryIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<String>, display_name: impl Into<String>) {
        let id = id.into();
        self.entries.insert(
            id.clone(),
            IdentityRef {
                id,
                display_name: display_name.into(),
            },
        );
    }
}

impl IdentityResolver for InMemoryIdentityResolver {
    fn resolve(&self, actor: &str) -> Option<IdentityRef> {
        self.entries.get(actor).map(|e| e.clone())
    }
}

/// Resolver that treats every identifier as its own directory entry. Useful
/// when no directory is wired in.
#[derive(Debug, Default)]
pub struct PassthroughIdentityResolver;

impl IdentityResolver for PassthroughIdentityResolver {
    fn resolve(&self, actor: &str) -> Option<IdentityRef> {
        Some(IdentityRef {
            id: actor.to_string(),
            display_name: actor.to_string(),
        })
    }
}

/// Substrate capability for executing a unit of work with a given identity
/// made current for its duration. Timer continuations run as the identity
/// bound to their task, or the configured system identity.
pub trait IdentityRunner: Send + Sync {
    fn run_as(&self, identity: &str, work: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// Runner for substrates without an ambient-identity facility: the work runs
/// unchanged.
#[derive(Debug, Default)]
pub struct PassthroughIdentityRunner;

impl IdentityRunner for PassthroughIdentityRunner {
    fn run_as(&self, _identity: &str, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        work()
    }
}
