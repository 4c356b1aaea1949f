use std::sync::Arc;

use crate::runtime::evaluator::{Evaluator, ExprEvaluator};
use crate::runtime::identity::{
    IdentityResolver, IdentityRunner, PassthroughIdentityResolver, PassthroughIdentityRunner,
};

/// Explicit context shared by every engine component: the expression
/// evaluator, the identity resolver and the run-as capability. Constructed
/// once and passed in rather than located through globals.
#[derive(Clone)]
pub struct EngineContext {
    pub evaluator: Arc<dyn Evaluator>,
    pub identities: Arc<dyn IdentityResolver>,
    pub runner: Arc<dyn IdentityRunner>,
}

impl EngineContext {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        identities: Arc<dyn IdentityResolver>,
        runner: Arc<dyn IdentityRunner>,
    ) -> Self {
        Self {
            evaluator,
            identities,
            runner,
        }
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            evaluator: Arc::new(ExprEvaluator),
            identities: Arc::new(PassthroughIdentityResolver),
            runner: Arc::new(PassthroughIdentityRunner),
        }
    }
}
