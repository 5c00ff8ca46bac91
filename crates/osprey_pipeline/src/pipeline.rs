//! The assembled pipeline.
//!
//! A `Pipeline` owns one or more built chains plus the authoritative node
//! map they share. Multi-phase constructs (`passive_reverser`, `sort_pipe`)
//! contribute two chains whose tokens are already linked by a depends-on
//! edge; adding both to the same pipeline schedules them together.

use std::io::Write;

use osprey_common::error::{OspreyError, OspreyResult};
use osprey_common::progress::{NullProgress, Progress};
use osprey_common::Runtime;

use crate::factory::{PipeEnd, TerminalFactory};
use crate::graph::{self, PhasePlan};
use crate::node::ControlFlow;
use crate::tokens::NodeMap;

pub struct Pipeline {
    rt: Runtime,
    chains: Vec<Box<dyn ControlFlow>>,
    map: Option<NodeMap>,
}

impl Pipeline {
    pub fn new(rt: &Runtime) -> Self {
        Self {
            rt: rt.clone(),
            chains: Vec::new(),
            map: None,
        }
    }

    /// Build a completed chain specification and take ownership of it.
    pub fn add<T>(&mut self, spec: PipeEnd<T>) -> &mut Self
    where
        T: TerminalFactory,
        T::Built: ControlFlow + 'static,
    {
        let mut chain = spec.0.build();
        let mut chain_map: Option<NodeMap> = None;
        chain.visit(&mut |op| {
            chain_map = Some(op.token().map());
            true
        });
        if let Some(m) = chain_map {
            match &self.map {
                Some(existing) => existing.union(&m),
                None => self.map = Some(m),
            }
        }
        self.chains.push(Box::new(chain));
        self
    }

    fn map(&self) -> OspreyResult<NodeMap> {
        self.map
            .as_ref()
            .map(|m| m.find_authority())
            .ok_or_else(|| OspreyError::Internal("pipeline has no chains".into()))
    }

    /// The schedule this pipeline would execute.
    pub fn plan(&self) -> OspreyResult<PhasePlan> {
        graph::plan(&self.map()?)
    }

    /// Run with an expected item count, a progress sink, and a memory
    /// budget per phase.
    pub fn run(
        &mut self,
        items: u64,
        progress: &mut dyn Progress,
        memory: u64,
    ) -> OspreyResult<()> {
        let map = self.map()?;
        let plan = graph::plan(&map)?;
        graph::execute(
            &mut self.chains,
            &map,
            &plan,
            items,
            progress,
            memory,
            &self.rt,
        )
    }

    /// Run silently with whatever memory the manager has left.
    pub fn run_default(&mut self) -> OspreyResult<()> {
        let memory = self.rt.memory().available();
        let mut progress = NullProgress;
        self.run(1, &mut progress, memory)
    }

    /// GraphViz dump of the node graph.
    pub fn plot(&self, out: &mut dyn Write) -> OspreyResult<()> {
        let map = self.map()?;
        graph::plot(&map, out).map_err(|e| OspreyError::Internal(e.to_string()))
    }

    /// GraphViz dump of the phase schedule.
    pub fn plot_phases(&self, out: &mut dyn Write) -> OspreyResult<()> {
        let plan = self.plan()?;
        graph::plot_phases(&plan, out).map_err(|e| OspreyError::Internal(e.to_string()))
    }
}
