//! The fused operator pipeline runtime.
//!
//! Operators compose with the `|` operator into chains that fuse at compile
//! time: each operator owns its downstream by value, and a `push` is a plain
//! method call. The scheduler discovers *phases* (connected components under
//! push/pull edges), orders them along the depends-on DAG, assigns each
//! phase its memory budget, and drives every phase from its single
//! initiator.
//!
//! Module map:
//!   - `tokens`: node identities, the shared id→entry map (union–find), and
//!     forwarded values
//!   - `node`: the operator lifecycle contract and the push/pull data plane
//!   - `graph`: phase discovery, scheduling, memory assignment, execution
//!   - `factory`: composition machinery (`|`, factories, terminators)
//!   - `operators`: the standard operator set
//!   - `virtual_chunk`: type-erased composable pipeline fragments
//!   - `parallel`: the data-parallel combinator
//!   - `pipeline`: the user-facing pipeline value

pub mod factory;
pub mod graph;
pub mod node;
pub mod operators;
pub mod parallel;
pub mod pipeline;
pub mod tokens;
pub mod virtual_chunk;

pub use factory::{Factory, PipeEnd, PipeMiddle, PullEnd, PullMiddle, PullSource, TerminalFactory};
pub use node::{ControlFlow, Operator, Pull, Push};
pub use pipeline::Pipeline;
pub use tokens::{NodeId, NodeMap, Relation, Token};
