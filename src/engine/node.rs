use std::sync::Arc;

use crate::core::Value;
use crate::engine::{Inputs, Node, NodeContext, NodeInfo, Outcome};

pub(crate) type SignatureFn = Arc<dyn Fn(&Inputs) -> anyhow::Result<Value> + Send + Sync>;
pub(crate) type CheckFn = Arc<dyn Fn(&Inputs) -> Result<(), String> + Send + Sync>;

/// A node kind backed by closures, see [`crate::KindDef`].
pub(crate) struct FnNode<F>
where
    F: Fn(&mut NodeContext<'_>, &Inputs) -> anyhow::Result<Outcome> + Send + Sync,
{
    pub callback: F,
    pub signature: Option<SignatureFn>,
    pub check: Option<CheckFn>,
}

impl<F> Node for FnNode<F>
where
    F: Fn(&mut NodeContext<'_>, &Inputs) -> anyhow::Result<Outcome> + Send + Sync,
{
    fn execute(&self, ctx: &mut NodeContext<'_>, inputs: &Inputs) -> anyhow::Result<Outcome> {
        (self.callback)(ctx, inputs)
    }

    fn signature(&self, _: &NodeInfo<'_>, inputs: &Inputs) -> Option<anyhow::Result<Value>> {
        self.signature.as_ref().map(|signature| signature(inputs))
    }

    fn check(&self, literals: &Inputs) -> Result<(), String> {
        match &self.check {
            Some(check) => check(literals),
            None => Ok(()),
        }
    }
}
