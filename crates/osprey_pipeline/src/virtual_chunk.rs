//! Type-erased, runtime-composable pipeline fragments.
//!
//! A `VirtualChunk<I, O>` is a factory for a chain segment consuming `I`
//! and producing `O`, with the concrete operator types erased. Two chunks
//! compose (`a | b`) exactly when the output type of the first equals the
//! input type of the second; the composed chunk is again a virtual chunk.
//! Crossing a chunk boundary costs one virtual call per item; inside a
//! chunk, fusion is unchanged.

use std::ops::BitOr;

use osprey_common::error::OspreyResult;
use osprey_common::progress::Progress;

use crate::factory::{Factory, PipeMiddle};
use crate::node::{ControlFlow, Operator, Push};
use crate::tokens::Token;

/// The object-safe face of a node at a chunk boundary.
pub trait ChunkNode: ControlFlow + Operator {
    type Item;
    fn push_item(&mut self, item: Self::Item) -> OspreyResult<()>;
}

impl<T> ChunkNode for T
where
    T: Push + ControlFlow + Operator,
{
    type Item = <T as Push>::Item;

    fn push_item(&mut self, item: Self::Item) -> OspreyResult<()> {
        self.push(item)
    }
}

impl<I> Push for Box<dyn ChunkNode<Item = I>> {
    type Item = I;

    fn push(&mut self, item: I) -> OspreyResult<()> {
        (**self).push_item(item)
    }
}

impl<I> ControlFlow for Box<dyn ChunkNode<Item = I>> {
    fn visit(&mut self, f: &mut dyn FnMut(&mut dyn Operator) -> bool) -> bool {
        (**self).visit(f)
    }
}

impl<I> Operator for Box<dyn ChunkNode<Item = I>> {
    fn token(&self) -> &Token {
        (**self).token()
    }
    fn prepare(&mut self) -> OspreyResult<()> {
        (**self).prepare()
    }
    fn set_available_memory(&mut self, bytes: u64) {
        (**self).set_available_memory(bytes)
    }
    fn begin(&mut self) -> OspreyResult<()> {
        (**self).begin()
    }
    fn end(&mut self) -> OspreyResult<()> {
        (**self).end()
    }
    fn can_evacuate(&self) -> bool {
        (**self).can_evacuate()
    }
    fn evacuate(&mut self) {
        (**self).evacuate()
    }
    fn go(&mut self, progress: &mut dyn Progress) -> OspreyResult<()> {
        (**self).go(progress)
    }
}

type ChunkBuild<I, O> =
    Box<dyn FnOnce(Box<dyn ChunkNode<Item = O>>) -> Box<dyn ChunkNode<Item = I>>>;

/// A type-erased chain fragment from `I` to `O`.
pub struct VirtualChunk<I, O> {
    build: ChunkBuild<I, O>,
}

impl<I: 'static, O: 'static> VirtualChunk<I, O> {
    /// Erase a fused fragment.
    pub fn new<F>(middle: PipeMiddle<F>) -> Self
    where
        F: Factory<Box<dyn ChunkNode<Item = O>>> + 'static,
        F::Built: ChunkNode<Item = I> + 'static,
    {
        let factory = middle.0;
        VirtualChunk {
            build: Box::new(move |dest| Box::new(factory.build(dest))),
        }
    }

    /// Compose with a chunk whose input is this chunk's output.
    pub fn pipe<U: 'static>(self, next: VirtualChunk<O, U>) -> VirtualChunk<I, U> {
        VirtualChunk {
            build: Box::new(move |dest| (self.build)((next.build)(dest))),
        }
    }

    /// Re-enter a fused chain as an ordinary middle fragment.
    pub fn into_middle(self) -> PipeMiddle<VirtualChunkFactory<I, O>> {
        PipeMiddle(VirtualChunkFactory { chunk: self })
    }
}

impl<I: 'static, O: 'static, U: 'static> BitOr<VirtualChunk<O, U>> for VirtualChunk<I, O> {
    type Output = VirtualChunk<I, U>;

    fn bitor(self, rhs: VirtualChunk<O, U>) -> Self::Output {
        self.pipe(rhs)
    }
}

/// Factory adapter: boxes the downstream node at the chunk boundary.
pub struct VirtualChunkFactory<I, O> {
    chunk: VirtualChunk<I, O>,
}

impl<I, O, D> Factory<D> for VirtualChunkFactory<I, O>
where
    I: 'static,
    O: 'static,
    D: ChunkNode<Item = O> + 'static,
{
    type Built = Box<dyn ChunkNode<Item = I>>;

    fn build(self, dest: D) -> Self::Built {
        (self.chunk.build)(Box::new(dest))
    }
}
