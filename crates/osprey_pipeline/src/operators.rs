//! The standard operator set.
//!
//! Sources are initiators: `item_source` drives an iterator, `input` a
//! fixed-item stream, `serialization_input` a record stream. Sinks
//! terminate chains; the ones that produce a value (`sum_sink`, `vec_sink`)
//! hand back a shared handle read after the run. `passive_reverser` and
//! `sort_pipe` are two-phase pairs: a sink for the producing phase and a
//! source for the consuming phase, linked by a depends-on edge.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use osprey_common::error::{OspreyError, OspreyResult};
use osprey_common::progress::Progress;
use osprey_common::Runtime;
use osprey_sort::ExternalSorter;
use osprey_stream::{Element, SerializationReader, SerializationWriter, Stream};

use crate::factory::{Factory, PipeEnd, PipeMiddle, PullEnd, PullSource, TerminalFactory};
use crate::graph::ITEMS_KEY;
use crate::node::{ControlFlow, Operator, Pull, Push};
use crate::tokens::Token;

/// Shared cell a value-producing sink writes its result into.
pub type SinkHandle<T> = Arc<Mutex<T>>;

macro_rules! impl_chain_control {
    ($op:ident < $($gen:ident),* > , dest) => {
        impl<$($gen),*> ControlFlow for $op<$($gen),*>
        where
            Self: Operator,
            D: ControlFlow,
        {
            fn visit(&mut self, f: &mut dyn FnMut(&mut dyn Operator) -> bool) -> bool {
                if f(self) {
                    return true;
                }
                self.dest.visit(f)
            }
        }
    };
    ($op:ident < $($gen:ident),* > , source) => {
        impl<$($gen),*> ControlFlow for $op<$($gen),*>
        where
            Self: Operator,
            S: ControlFlow,
        {
            fn visit(&mut self, f: &mut dyn FnMut(&mut dyn Operator) -> bool) -> bool {
                if f(self) {
                    return true;
                }
                self.source.visit(f)
            }
        }
    };
    ($op:ident < $($gen:ident),* > , leaf) => {
        impl<$($gen),*> ControlFlow for $op<$($gen),*>
        where
            Self: Operator,
        {
            fn visit(&mut self, f: &mut dyn FnMut(&mut dyn Operator) -> bool) -> bool {
                f(self)
            }
        }
    };
}

// ── item_source ──────────────────────────────────────────────────────────────

/// Push every item of an iterator downstream; the phase initiator.
pub fn item_source<I: Iterator>(iter: I) -> PipeMiddle<ItemSourceFactory<I>> {
    PipeMiddle(ItemSourceFactory { iter })
}

pub struct ItemSourceFactory<I> {
    iter: I,
}

impl<I, D> Factory<D> for ItemSourceFactory<I>
where
    I: Iterator,
    D: Push<Item = I::Item> + Operator,
{
    type Built = ItemSource<I, D>;

    fn build(self, dest: D) -> Self::Built {
        let token = Token::new("item source");
        token.add_push_destination(dest.token());
        ItemSource {
            token,
            iter: Some(self.iter),
            dest,
        }
    }
}

pub struct ItemSource<I, D> {
    token: Token,
    iter: Option<I>,
    dest: D,
}

impl<I, D> Operator for ItemSource<I, D>
where
    I: Iterator,
    D: Push<Item = I::Item> + Operator,
{
    fn token(&self) -> &Token {
        &self.token
    }

    fn begin(&mut self) -> OspreyResult<()> {
        if let Some(n) = self.token.fetch::<u64>(ITEMS_KEY) {
            self.token.set_steps(n);
        }
        Ok(())
    }

    fn go(&mut self, progress: &mut dyn Progress) -> OspreyResult<()> {
        let iter = self
            .iter
            .take()
            .ok_or_else(|| OspreyError::Internal("item source driven twice".into()))?;
        for item in iter {
            self.dest.push(item)?;
            progress.step(1);
        }
        Ok(())
    }
}

impl_chain_control!(ItemSource<I, D>, dest);

// ── input / output (fixed-item streams) ─────────────────────────────────────

/// Push a stream's items downstream; forwards the item count.
pub fn input<T: Element>(stream: Stream<T>) -> PipeMiddle<InputFactory<T>> {
    PipeMiddle(InputFactory { stream })
}

pub struct InputFactory<T> {
    stream: Stream<T>,
}

impl<T, D> Factory<D> for InputFactory<T>
where
    T: Element,
    D: Push<Item = T> + Operator,
{
    type Built = Input<T, D>;

    fn build(self, dest: D) -> Self::Built {
        let token = Token::new("input");
        token.add_push_destination(dest.token());
        Input {
            token,
            stream: self.stream,
            dest,
        }
    }
}

pub struct Input<T, D> {
    token: Token,
    stream: Stream<T>,
    dest: D,
}

impl<T, D> Operator for Input<T, D>
where
    T: Element,
    D: Push<Item = T> + Operator,
{
    fn token(&self) -> &Token {
        &self.token
    }

    fn prepare(&mut self) -> OspreyResult<()> {
        self.token.forward(ITEMS_KEY, self.stream.size());
        self.token.set_steps(self.stream.size());
        Ok(())
    }

    fn go(&mut self, progress: &mut dyn Progress) -> OspreyResult<()> {
        self.stream.seek_item(0)?;
        while self.stream.can_read() {
            self.dest.push(self.stream.read_item()?)?;
            progress.step(1);
        }
        Ok(())
    }

    fn end(&mut self) -> OspreyResult<()> {
        self.stream.close()
    }
}

impl_chain_control!(Input<T, D>, dest);

/// Write incoming items to a stream.
pub fn output<T: Element>(stream: Stream<T>) -> PipeEnd<OutputFactory<T>> {
    PipeEnd(OutputFactory { stream })
}

pub struct OutputFactory<T> {
    stream: Stream<T>,
}

impl<T: Element> TerminalFactory for OutputFactory<T> {
    type Built = Output<T>;

    fn build(self) -> Self::Built {
        Output {
            token: Token::new("output"),
            stream: self.stream,
        }
    }
}

pub struct Output<T> {
    token: Token,
    stream: Stream<T>,
}

impl<T: Element> Push for Output<T> {
    type Item = T;

    fn push(&mut self, item: T) -> OspreyResult<()> {
        self.stream.write_item(item)
    }
}

impl<T: Element> Operator for Output<T> {
    fn token(&self) -> &Token {
        &self.token
    }

    fn end(&mut self) -> OspreyResult<()> {
        self.stream.close()
    }
}

impl_chain_control!(Output<T>, leaf);

// ── serialization input / output ─────────────────────────────────────────────

/// Push a serialization stream's records downstream.
pub fn serialization_input<T: DeserializeOwned + 'static>(
    reader: SerializationReader,
) -> PipeMiddle<SerializationInputFactory<T>> {
    PipeMiddle(SerializationInputFactory {
        reader,
        _marker: PhantomData,
    })
}

pub struct SerializationInputFactory<T> {
    reader: SerializationReader,
    _marker: PhantomData<fn() -> T>,
}

impl<T, D> Factory<D> for SerializationInputFactory<T>
where
    T: DeserializeOwned + 'static,
    D: Push<Item = T> + Operator,
{
    type Built = SerializationInput<T, D>;

    fn build(self, dest: D) -> Self::Built {
        let token = Token::new("serialization input");
        token.add_push_destination(dest.token());
        SerializationInput {
            token,
            reader: self.reader,
            dest,
            _marker: PhantomData,
        }
    }
}

pub struct SerializationInput<T, D> {
    token: Token,
    reader: SerializationReader,
    dest: D,
    _marker: PhantomData<fn() -> T>,
}

impl<T, D> Operator for SerializationInput<T, D>
where
    T: DeserializeOwned + 'static,
    D: Push<Item = T> + Operator,
{
    fn token(&self) -> &Token {
        &self.token
    }

    fn go(&mut self, progress: &mut dyn Progress) -> OspreyResult<()> {
        while self.reader.can_read() {
            self.dest.push(self.reader.read_record()?)?;
            progress.step(1);
        }
        Ok(())
    }

    fn end(&mut self) -> OspreyResult<()> {
        self.reader.close()
    }
}

impl_chain_control!(SerializationInput<T, D>, dest);

/// Write incoming records to a serialization stream.
pub fn serialization_output<T: Serialize + 'static>(
    writer: SerializationWriter,
) -> PipeEnd<SerializationOutputFactory<T>> {
    PipeEnd(SerializationOutputFactory {
        writer,
        _marker: PhantomData,
    })
}

pub struct SerializationOutputFactory<T> {
    writer: SerializationWriter,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize + 'static> TerminalFactory for SerializationOutputFactory<T> {
    type Built = SerializationOutput<T>;

    fn build(self) -> Self::Built {
        SerializationOutput {
            token: Token::new("serialization output"),
            writer: self.writer,
            _marker: PhantomData,
        }
    }
}

pub struct SerializationOutput<T> {
    token: Token,
    writer: SerializationWriter,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize + 'static> Push for SerializationOutput<T> {
    type Item = T;

    fn push(&mut self, item: T) -> OspreyResult<()> {
        self.writer.write_record(&item)?;
        Ok(())
    }
}

impl<T: Serialize + 'static> Operator for SerializationOutput<T> {
    fn token(&self) -> &Token {
        &self.token
    }

    fn end(&mut self) -> OspreyResult<()> {
        self.writer.close()
    }
}

impl_chain_control!(SerializationOutput<T>, leaf);

// ── map / filter / for_each ──────────────────────────────────────────────────

/// Transform each item.
pub fn map<I, O, F: FnMut(I) -> O>(f: F) -> PipeMiddle<MapFactory<I, O, F>> {
    PipeMiddle(MapFactory {
        f,
        _marker: PhantomData,
    })
}

pub struct MapFactory<I, O, F> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F: Clone> Clone for MapFactory<I, O, F> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            _marker: PhantomData,
        }
    }
}

impl<I, O, F, D> Factory<D> for MapFactory<I, O, F>
where
    F: FnMut(I) -> O,
    D: Push<Item = O> + Operator,
{
    type Built = Map<I, O, F, D>;

    fn build(self, dest: D) -> Self::Built {
        let token = Token::new("map");
        token.add_push_destination(dest.token());
        Map {
            token,
            f: self.f,
            dest,
            _marker: PhantomData,
        }
    }
}

pub struct Map<I, O, F, D> {
    token: Token,
    f: F,
    dest: D,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F, D> Push for Map<I, O, F, D>
where
    F: FnMut(I) -> O,
    D: Push<Item = O>,
{
    type Item = I;

    fn push(&mut self, item: I) -> OspreyResult<()> {
        self.dest.push((self.f)(item))
    }
}

impl<I, O, F, D> Operator for Map<I, O, F, D>
where
    F: FnMut(I) -> O,
    D: Push<Item = O> + Operator,
{
    fn token(&self) -> &Token {
        &self.token
    }
}

impl_chain_control!(Map<I, O, F, D>, dest);

/// Keep only items the predicate accepts.
pub fn filter<I, F: FnMut(&I) -> bool>(pred: F) -> PipeMiddle<FilterFactory<I, F>> {
    PipeMiddle(FilterFactory {
        pred,
        _marker: PhantomData,
    })
}

pub struct FilterFactory<I, F> {
    pred: F,
    _marker: PhantomData<fn(I)>,
}

impl<I, F: Clone> Clone for FilterFactory<I, F> {
    fn clone(&self) -> Self {
        Self {
            pred: self.pred.clone(),
            _marker: PhantomData,
        }
    }
}

impl<I, F, D> Factory<D> for FilterFactory<I, F>
where
    F: FnMut(&I) -> bool,
    D: Push<Item = I> + Operator,
{
    type Built = Filter<I, F, D>;

    fn build(self, dest: D) -> Self::Built {
        let token = Token::new("filter");
        token.add_push_destination(dest.token());
        Filter {
            token,
            pred: self.pred,
            dest,
            _marker: PhantomData,
        }
    }
}

pub struct Filter<I, F, D> {
    token: Token,
    pred: F,
    dest: D,
    _marker: PhantomData<fn(I)>,
}

impl<I, F, D> Push for Filter<I, F, D>
where
    F: FnMut(&I) -> bool,
    D: Push<Item = I>,
{
    type Item = I;

    fn push(&mut self, item: I) -> OspreyResult<()> {
        if (self.pred)(&item) {
            self.dest.push(item)?;
        }
        Ok(())
    }
}

impl<I, F, D> Operator for Filter<I, F, D>
where
    F: FnMut(&I) -> bool,
    D: Push<Item = I> + Operator,
{
    fn token(&self) -> &Token {
        &self.token
    }
}

impl_chain_control!(Filter<I, F, D>, dest);

/// Run a closure on each item; a sink.
pub fn for_each<I, F: FnMut(I)>(f: F) -> PipeEnd<ForEachFactory<I, F>> {
    PipeEnd(ForEachFactory {
        f,
        _marker: PhantomData,
    })
}

pub struct ForEachFactory<I, F> {
    f: F,
    _marker: PhantomData<fn(I)>,
}

impl<I, F: FnMut(I)> TerminalFactory for ForEachFactory<I, F> {
    type Built = ForEach<I, F>;

    fn build(self) -> Self::Built {
        ForEach {
            token: Token::new("for each"),
            f: self.f,
            _marker: PhantomData,
        }
    }
}

pub struct ForEach<I, F> {
    token: Token,
    f: F,
    _marker: PhantomData<fn(I)>,
}

impl<I, F: FnMut(I)> Push for ForEach<I, F> {
    type Item = I;

    fn push(&mut self, item: I) -> OspreyResult<()> {
        (self.f)(item);
        Ok(())
    }
}

impl<I, F: FnMut(I)> Operator for ForEach<I, F> {
    fn token(&self) -> &Token {
        &self.token
    }
}

impl_chain_control!(ForEach<I, F>, leaf);

// ── sum / vec sinks ──────────────────────────────────────────────────────────

/// Sum all items; the handle holds the total after the run.
pub fn sum_sink<T>() -> (PipeEnd<SumFactory<T>>, SinkHandle<T>)
where
    T: std::ops::AddAssign + Default + Copy + 'static,
{
    let handle: SinkHandle<T> = Arc::new(Mutex::new(T::default()));
    (
        PipeEnd(SumFactory {
            handle: handle.clone(),
        }),
        handle,
    )
}

pub struct SumFactory<T> {
    handle: SinkHandle<T>,
}

impl<T> TerminalFactory for SumFactory<T>
where
    T: std::ops::AddAssign + Default + Copy + 'static,
{
    type Built = Sum<T>;

    fn build(self) -> Self::Built {
        Sum {
            token: Token::new("sum"),
            total: T::default(),
            handle: self.handle,
        }
    }
}

pub struct Sum<T> {
    token: Token,
    total: T,
    handle: SinkHandle<T>,
}

impl<T: std::ops::AddAssign + Default + Copy + 'static> Push for Sum<T> {
    type Item = T;

    fn push(&mut self, item: T) -> OspreyResult<()> {
        self.total += item;
        Ok(())
    }
}

impl<T: std::ops::AddAssign + Default + Copy + 'static> Operator for Sum<T> {
    fn token(&self) -> &Token {
        &self.token
    }

    fn end(&mut self) -> OspreyResult<()> {
        *self.handle.lock() = self.total;
        Ok(())
    }
}

impl_chain_control!(Sum<T>, leaf);

/// Collect all items; the handle holds the vector after the run.
pub fn vec_sink<T: 'static>() -> (PipeEnd<VecSinkFactory<T>>, SinkHandle<Vec<T>>) {
    let handle: SinkHandle<Vec<T>> = Arc::new(Mutex::new(Vec::new()));
    (
        PipeEnd(VecSinkFactory {
            handle: handle.clone(),
        }),
        handle,
    )
}

pub struct VecSinkFactory<T> {
    handle: SinkHandle<Vec<T>>,
}

impl<T: 'static> TerminalFactory for VecSinkFactory<T> {
    type Built = VecSink<T>;

    fn build(self) -> Self::Built {
        VecSink {
            token: Token::new("vector sink"),
            handle: self.handle,
        }
    }
}

pub struct VecSink<T> {
    token: Token,
    handle: SinkHandle<Vec<T>>,
}

impl<T: 'static> Push for VecSink<T> {
    type Item = T;

    fn push(&mut self, item: T) -> OspreyResult<()> {
        self.handle.lock().push(item);
        Ok(())
    }
}

impl<T: 'static> Operator for VecSink<T> {
    fn token(&self) -> &Token {
        &self.token
    }

    fn begin(&mut self) -> OspreyResult<()> {
        if let Some(n) = self.token.fetch::<u64>(ITEMS_KEY) {
            self.handle.lock().reserve(n as usize);
        }
        Ok(())
    }
}

impl_chain_control!(VecSink<T>, leaf);

// ── passive reverser ─────────────────────────────────────────────────────────

/// A two-phase buffer: the sink half collects a phase's items, the source
/// half pushes them out *in reverse order* in a later phase. The source's
/// phase depends on the sink's.
pub fn passive_reverser<T: Send + 'static>() -> (
    PipeEnd<ReverserInputFactory<T>>,
    PipeMiddle<ReverserOutputFactory<T>>,
) {
    let buffer: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));
    let input_token = Token::new("reverser input");
    input_token.set_name("reverser input", 5);
    let output_token = Token::new("reverser output");
    output_token.set_name("reverser output", 5);
    output_token.add_dependency(&input_token);
    (
        PipeEnd(ReverserInputFactory {
            token: input_token,
            buffer: buffer.clone(),
        }),
        PipeMiddle(ReverserOutputFactory {
            token: output_token,
            buffer,
        }),
    )
}

pub struct ReverserInputFactory<T> {
    token: Token,
    buffer: Arc<Mutex<Vec<T>>>,
}

impl<T: Send + 'static> TerminalFactory for ReverserInputFactory<T> {
    type Built = ReverserInput<T>;

    fn build(self) -> Self::Built {
        ReverserInput {
            token: self.token,
            buffer: self.buffer,
        }
    }
}

pub struct ReverserInput<T> {
    token: Token,
    buffer: Arc<Mutex<Vec<T>>>,
}

impl<T: Send + 'static> Push for ReverserInput<T> {
    type Item = T;

    fn push(&mut self, item: T) -> OspreyResult<()> {
        self.buffer.lock().push(item);
        Ok(())
    }
}

impl<T: Send + 'static> Operator for ReverserInput<T> {
    fn token(&self) -> &Token {
        &self.token
    }
}

impl_chain_control!(ReverserInput<T>, leaf);

pub struct ReverserOutputFactory<T> {
    token: Token,
    buffer: Arc<Mutex<Vec<T>>>,
}

impl<T, D> Factory<D> for ReverserOutputFactory<T>
where
    T: Send + 'static,
    D: Push<Item = T> + Operator,
{
    type Built = ReverserOutput<T, D>;

    fn build(self, dest: D) -> Self::Built {
        self.token.add_push_destination(dest.token());
        ReverserOutput {
            token: self.token,
            buffer: self.buffer,
            dest,
        }
    }
}

pub struct ReverserOutput<T, D> {
    token: Token,
    buffer: Arc<Mutex<Vec<T>>>,
    dest: D,
}

impl<T, D> Operator for ReverserOutput<T, D>
where
    T: Send + 'static,
    D: Push<Item = T> + Operator,
{
    fn token(&self) -> &Token {
        &self.token
    }

    fn go(&mut self, progress: &mut dyn Progress) -> OspreyResult<()> {
        let items = std::mem::take(&mut *self.buffer.lock());
        for item in items.into_iter().rev() {
            self.dest.push(item)?;
            progress.step(1);
        }
        Ok(())
    }
}

impl_chain_control!(ReverserOutput<T, D>, dest);

// ── external sort pair ───────────────────────────────────────────────────────

type BoxedCmp<T> = Box<dyn Fn(&T, &T) -> Ordering + Send>;

struct SortState<T> {
    cmp: Option<BoxedCmp<T>>,
    sorter: Option<ExternalSorter<T, BoxedCmp<T>>>,
}

/// A two-phase external sort: the sink half forms runs while its phase
/// pushes into it and merges on `end`; the source half streams the sorted
/// records in a later phase.
pub fn sort_pipe<T>(
    rt: &Runtime,
    minimum_item_size: u64,
    cmp: impl Fn(&T, &T) -> Ordering + Send + 'static,
) -> (
    PipeEnd<SortInputFactory<T>>,
    PipeMiddle<SortOutputFactory<T>>,
)
where
    T: Serialize + DeserializeOwned + 'static,
{
    let state = Arc::new(Mutex::new(SortState {
        cmp: Some(Box::new(cmp) as BoxedCmp<T>),
        sorter: None,
    }));
    let input_token = Token::new("sort input");
    input_token.set_name("sort input", 5);
    // The run former wants every byte the phase can spare.
    input_token.set_memory(1.0, 64 * 1024);
    let output_token = Token::new("sort output");
    output_token.set_name("sort output", 5);
    output_token.add_dependency(&input_token);
    (
        PipeEnd(SortInputFactory {
            token: input_token,
            rt: rt.clone(),
            minimum_item_size,
            state: state.clone(),
        }),
        PipeMiddle(SortOutputFactory {
            token: output_token,
            state,
        }),
    )
}

pub struct SortInputFactory<T> {
    token: Token,
    rt: Runtime,
    minimum_item_size: u64,
    state: Arc<Mutex<SortState<T>>>,
}

impl<T> TerminalFactory for SortInputFactory<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    type Built = SortInput<T>;

    fn build(self) -> Self::Built {
        SortInput {
            token: self.token,
            rt: self.rt,
            minimum_item_size: self.minimum_item_size,
            state: self.state,
            available_memory: 0,
        }
    }
}

pub struct SortInput<T> {
    token: Token,
    rt: Runtime,
    minimum_item_size: u64,
    state: Arc<Mutex<SortState<T>>>,
    available_memory: u64,
}

impl<T> Push for SortInput<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    type Item = T;

    fn push(&mut self, item: T) -> OspreyResult<()> {
        let mut state = self.state.lock();
        state
            .sorter
            .as_mut()
            .ok_or_else(|| OspreyError::Internal("sort input pushed before begin".into()))?
            .push(&item)
    }
}

impl<T> Operator for SortInput<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn token(&self) -> &Token {
        &self.token
    }

    fn set_available_memory(&mut self, bytes: u64) {
        self.available_memory = bytes;
    }

    fn begin(&mut self) -> OspreyResult<()> {
        let mut state = self.state.lock();
        let cmp = state
            .cmp
            .take()
            .ok_or_else(|| OspreyError::Internal("sort input begun twice".into()))?;
        state.sorter = Some(ExternalSorter::new(
            &self.rt,
            self.available_memory,
            self.minimum_item_size,
            cmp,
        )?);
        Ok(())
    }

    fn end(&mut self) -> OspreyResult<()> {
        let mut state = self.state.lock();
        state
            .sorter
            .as_mut()
            .ok_or_else(|| OspreyError::Internal("sort input ended before begin".into()))?
            .end()
    }
}

impl_chain_control!(SortInput<T>, leaf);

pub struct SortOutputFactory<T> {
    token: Token,
    state: Arc<Mutex<SortState<T>>>,
}

impl<T, D> Factory<D> for SortOutputFactory<T>
where
    T: Serialize + DeserializeOwned + 'static,
    D: Push<Item = T> + Operator,
{
    type Built = SortOutput<T, D>;

    fn build(self, dest: D) -> Self::Built {
        self.token.add_push_destination(dest.token());
        SortOutput {
            token: self.token,
            state: self.state,
            dest,
        }
    }
}

pub struct SortOutput<T, D> {
    token: Token,
    state: Arc<Mutex<SortState<T>>>,
    dest: D,
}

impl<T, D> Operator for SortOutput<T, D>
where
    T: Serialize + DeserializeOwned + 'static,
    D: Push<Item = T> + Operator,
{
    fn token(&self) -> &Token {
        &self.token
    }

    fn go(&mut self, progress: &mut dyn Progress) -> OspreyResult<()> {
        let mut state = self.state.lock();
        let sorter = state
            .sorter
            .as_mut()
            .ok_or_else(|| OspreyError::Internal("sort output ran before the sort phase".into()))?;
        while sorter.can_pull() {
            self.dest.push(sorter.pull()?)?;
            progress.step(1);
        }
        Ok(())
    }

    fn end(&mut self) -> OspreyResult<()> {
        // Drop the sorter and its temporaries.
        self.state.lock().sorter = None;
        Ok(())
    }
}

impl_chain_control!(SortOutput<T, D>, dest);

// ── pull operators ───────────────────────────────────────────────────────────

/// The producing end of a pull chain: items come from a fixed-item stream.
pub fn pull_input<T: Element>(stream: Stream<T>) -> PullSource<PullInputFactory<T>> {
    PullSource(PullInputFactory { stream })
}

pub struct PullInputFactory<T> {
    stream: Stream<T>,
}

impl<T: Element> TerminalFactory for PullInputFactory<T> {
    type Built = PullInput<T>;

    fn build(self) -> Self::Built {
        PullInput {
            token: Token::new("pull input"),
            stream: self.stream,
        }
    }
}

pub struct PullInput<T> {
    token: Token,
    stream: Stream<T>,
}

impl<T: Element> Pull for PullInput<T> {
    type Item = T;

    fn can_pull(&mut self) -> bool {
        self.stream.can_read()
    }

    fn pull(&mut self) -> OspreyResult<T> {
        self.stream.read_item()
    }
}

impl<T: Element> Operator for PullInput<T> {
    fn token(&self) -> &Token {
        &self.token
    }

    fn prepare(&mut self) -> OspreyResult<()> {
        self.token.forward(ITEMS_KEY, self.stream.size());
        Ok(())
    }

    fn begin(&mut self) -> OspreyResult<()> {
        self.stream.seek_item(0)
    }

    fn end(&mut self) -> OspreyResult<()> {
        self.stream.close()
    }
}

impl_chain_control!(PullInput<T>, leaf);

/// Transform each pulled item.
pub fn pull_map<I, O, F: FnMut(I) -> O>(f: F) -> crate::factory::PullMiddle<PullMapFactory<I, O, F>> {
    crate::factory::PullMiddle(PullMapFactory {
        f,
        _marker: PhantomData,
    })
}

pub struct PullMapFactory<I, O, F> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F, S> Factory<S> for PullMapFactory<I, O, F>
where
    F: FnMut(I) -> O,
    S: Pull<Item = I> + Operator,
{
    type Built = PullMap<I, O, F, S>;

    fn build(self, source: S) -> Self::Built {
        let token = Token::new("pull map");
        token.add_pull_destination(source.token());
        PullMap {
            token,
            f: self.f,
            source,
            _marker: PhantomData,
        }
    }
}

pub struct PullMap<I, O, F, S> {
    token: Token,
    f: F,
    source: S,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F, S> Pull for PullMap<I, O, F, S>
where
    F: FnMut(I) -> O,
    S: Pull<Item = I>,
{
    type Item = O;

    fn can_pull(&mut self) -> bool {
        self.source.can_pull()
    }

    fn pull(&mut self) -> OspreyResult<O> {
        Ok((self.f)(self.source.pull()?))
    }
}

impl<I, O, F, S> Operator for PullMap<I, O, F, S>
where
    F: FnMut(I) -> O,
    S: Pull<Item = I> + Operator,
{
    fn token(&self) -> &Token {
        &self.token
    }
}

impl_chain_control!(PullMap<I, O, F, S>, source);

/// The consuming, initiating end of a pull chain: drains its upstream into
/// a stream.
pub fn pull_output<T: Element>(stream: Stream<T>) -> PullEnd<PullOutputFactory<T>> {
    PullEnd(PullOutputFactory { stream })
}

pub struct PullOutputFactory<T> {
    stream: Stream<T>,
}

impl<T, S> Factory<S> for PullOutputFactory<T>
where
    T: Element,
    S: Pull<Item = T> + Operator,
{
    type Built = PullOutput<T, S>;

    fn build(self, source: S) -> Self::Built {
        let token = Token::new("pull output");
        token.add_pull_destination(source.token());
        PullOutput {
            token,
            stream: self.stream,
            source,
        }
    }
}

pub struct PullOutput<T, S> {
    token: Token,
    stream: Stream<T>,
    source: S,
}

impl<T, S> Operator for PullOutput<T, S>
where
    T: Element,
    S: Pull<Item = T> + Operator,
{
    fn token(&self) -> &Token {
        &self.token
    }

    fn go(&mut self, progress: &mut dyn Progress) -> OspreyResult<()> {
        while self.source.can_pull() {
            self.stream.write_item(self.source.pull()?)?;
            progress.step(1);
        }
        Ok(())
    }

    fn end(&mut self) -> OspreyResult<()> {
        self.stream.close()
    }
}

impl_chain_control!(PullOutput<T, S>, source);
