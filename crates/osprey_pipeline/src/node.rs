//! The operator contract.
//!
//! The control plane and the data plane are separate. Control, the
//! lifecycle the scheduler drives, is the object-safe `Operator` trait,
//! reached through `ControlFlow::visit` traversal of a fused chain. The
//! `push`/`pull` data plane between neighbours stays monomorphized: an operator owns
//! its destination by value and calls it directly.
//!
//! Lifecycle order within a phase: `prepare` (topo order, once sizes are
//! known) → `set_available_memory` → `begin` (topo order, forwarded values
//! visible) → the initiator's `go` → `end` (reverse topo order). A node
//! holding cross-phase state may be asked to `evacuate` between phases.

use osprey_common::error::{OspreyError, OspreyResult};
use osprey_common::progress::Progress;

use crate::tokens::Token;

/// The scheduler-facing lifecycle of one node.
pub trait Operator {
    fn token(&self) -> &Token;

    /// Called after all edges are known, before memory assignment. The
    /// place to `forward` values and adjust memory requests.
    fn prepare(&mut self) -> OspreyResult<()> {
        Ok(())
    }

    /// The phase's memory verdict for this node.
    fn set_available_memory(&mut self, _bytes: u64) {}

    /// Called in topological order before the initiator runs; forwarded
    /// values from upstream are visible.
    fn begin(&mut self) -> OspreyResult<()> {
        Ok(())
    }

    /// Called in reverse topological order after the initiator returns.
    fn end(&mut self) -> OspreyResult<()> {
        Ok(())
    }

    /// Whether this node can release cross-phase buffers early.
    fn can_evacuate(&self) -> bool {
        false
    }

    fn evacuate(&mut self) {}

    /// Drive the phase. Only the initiator's `go` is invoked.
    fn go(&mut self, _progress: &mut dyn Progress) -> OspreyResult<()> {
        Err(OspreyError::Internal(format!(
            "node '{}' is not an initiator",
            self.token().name()
        )))
    }
}

/// Push-capability data plane: accept one item from upstream.
pub trait Push {
    type Item;
    fn push(&mut self, item: Self::Item) -> OspreyResult<()>;
}

/// Pull-capability data plane: yield items to downstream on demand.
pub trait Pull {
    type Item;
    fn can_pull(&mut self) -> bool;
    fn pull(&mut self) -> OspreyResult<Self::Item>;
}

/// Control-plane traversal of a fused chain.
///
/// `visit` walks every node in the chain (an operator, then whatever it
/// owns) until the callback returns `true`. The scheduler uses it to reach
/// individual nodes by id without holding references into the chain.
pub trait ControlFlow {
    /// Visit nodes until `f` returns true; returns whether it did.
    fn visit(&mut self, f: &mut dyn FnMut(&mut dyn Operator) -> bool) -> bool;
}

/// Run a lifecycle closure on the node with the given id, if it lives in
/// this chain.
pub fn control<R>(
    chain: &mut dyn ControlFlow,
    target: crate::tokens::NodeId,
    f: impl FnOnce(&mut dyn Operator) -> R,
) -> Option<R> {
    let mut f = Some(f);
    let mut result = None;
    chain.visit(&mut |op| {
        if op.token().id() == target {
            if let Some(f) = f.take() {
                result = Some(f(op));
            }
            true
        } else {
            false
        }
    });
    result
}
