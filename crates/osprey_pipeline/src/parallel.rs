//! The data-parallel combinator.
//!
//! Wraps a middle fragment `f`; at runtime, buffers of items are handed to
//! worker threads, each running an independent copy of `f` fused to a
//! collector. Handoffs go through bounded channels in both directions, so
//! a fast producer blocks when every worker is busy and workers block when
//! the consumer lags. With `maintain_order`, a sequence-numbered reorder
//! buffer restores input order before anything is pushed downstream; the
//! buffer never holds more than the bounded number of in-flight batches.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use osprey_common::error::{OspreyError, OspreyResult};

use crate::factory::{Factory, PipeMiddle};
use crate::node::{ControlFlow, Operator, Push};
use crate::tokens::Token;

/// How a parallel section runs.
#[derive(Debug, Clone, Copy)]
pub struct ParallelPolicy {
    /// Deliver outputs in input order.
    pub maintain_order: bool,
    /// Worker threads; 0 means one per CPU.
    pub workers: usize,
    /// Items per dispatched batch.
    pub buffer_items: usize,
}

impl Default for ParallelPolicy {
    fn default() -> Self {
        Self {
            maintain_order: true,
            workers: 0,
            buffer_items: 1024,
        }
    }
}

impl ParallelPolicy {
    fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Run `inner` on worker threads over batches of items.
pub fn parallel<I, O, F>(
    inner: PipeMiddle<F>,
    policy: ParallelPolicy,
) -> PipeMiddle<ParallelFactory<I, O, F>> {
    PipeMiddle(ParallelFactory {
        inner: inner.0,
        policy,
        _marker: std::marker::PhantomData,
    })
}

pub struct ParallelFactory<I, O, F> {
    inner: F,
    policy: ParallelPolicy,
    _marker: std::marker::PhantomData<fn(I) -> O>,
}

impl<I, O, F, D> Factory<D> for ParallelFactory<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Factory<Collector<O>> + Clone + Send + 'static,
    F::Built: Push<Item = I> + ControlFlow + Send + 'static,
    D: Push<Item = O> + Operator,
{
    type Built = Parallel<I, O, F, D>;

    fn build(self, dest: D) -> Self::Built {
        let token = Token::new("parallel");
        token.add_push_destination(dest.token());
        Parallel {
            token,
            inner: Some(self.inner),
            policy: self.policy,
            dest,
            workers: None,
            buffer: Vec::new(),
            send_seq: 0,
            next_emit: 0,
            reorder: BTreeMap::new(),
        }
    }
}

type Batch<T> = (u64, Vec<T>);

struct WorkerPool<I, O> {
    inputs: Vec<SyncSender<Batch<I>>>,
    output: Receiver<(u64, OspreyResult<Vec<O>>)>,
    handles: Vec<JoinHandle<()>>,
    next_worker: usize,
}

/// The boundary node owning the worker pool.
pub struct Parallel<I, O, F, D> {
    token: Token,
    inner: Option<F>,
    policy: ParallelPolicy,
    dest: D,
    workers: Option<WorkerPool<I, O>>,
    buffer: Vec<I>,
    send_seq: u64,
    next_emit: u64,
    reorder: BTreeMap<u64, Vec<O>>,
}

/// The sink fused below each worker's copy of the inner fragment.
pub struct Collector<O> {
    token: Token,
    sink: Arc<Mutex<Vec<O>>>,
}

impl<O> Push for Collector<O> {
    type Item = O;

    fn push(&mut self, item: O) -> OspreyResult<()> {
        self.sink.lock().push(item);
        Ok(())
    }
}

impl<O> Operator for Collector<O> {
    fn token(&self) -> &Token {
        &self.token
    }
}

impl<O> ControlFlow for Collector<O> {
    fn visit(&mut self, f: &mut dyn FnMut(&mut dyn Operator) -> bool) -> bool {
        f(self)
    }
}

fn worker_loop<I, O, F>(factory: F, input: Receiver<Batch<I>>, output: SyncSender<(u64, OspreyResult<Vec<O>>)>)
where
    F: Factory<Collector<O>>,
    F::Built: Push<Item = I> + ControlFlow,
{
    let sink: Arc<Mutex<Vec<O>>> = Arc::new(Mutex::new(Vec::new()));
    let mut chain = factory.build(Collector {
        token: Token::new("parallel collector"),
        sink: sink.clone(),
    });
    chain.visit(&mut |op| {
        if let Err(err) = op.begin() {
            tracing::warn!(%err, "parallel worker begin failed");
        }
        false
    });
    for (seq, batch) in input.iter() {
        let mut failure = None;
        for item in batch {
            if let Err(err) = chain.push(item) {
                failure = Some(err);
                break;
            }
        }
        let outputs = std::mem::take(&mut *sink.lock());
        let message = match failure {
            None => (seq, Ok(outputs)),
            Some(err) => (seq, Err(err)),
        };
        if output.send(message).is_err() {
            return;
        }
    }
    chain.visit(&mut |op| {
        if let Err(err) = op.end() {
            tracing::warn!(%err, "parallel worker end failed");
        }
        false
    });
}

/// Deliver one completed batch: directly, or through the reorder buffer.
fn deliver<O, D: Push<Item = O>>(
    dest: &mut D,
    reorder: &mut BTreeMap<u64, Vec<O>>,
    next_emit: &mut u64,
    maintain_order: bool,
    seq: u64,
    outputs: Vec<O>,
) -> OspreyResult<()> {
    if !maintain_order {
        for item in outputs {
            dest.push(item)?;
        }
        return Ok(());
    }
    reorder.insert(seq, outputs);
    while let Some(ready) = reorder.remove(&*next_emit) {
        for item in ready {
            dest.push(item)?;
        }
        *next_emit += 1;
    }
    Ok(())
}

impl<I, O, F, D> Parallel<I, O, F, D>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Factory<Collector<O>> + Clone + Send + 'static,
    F::Built: Push<Item = I> + ControlFlow + Send + 'static,
    D: Push<Item = O> + Operator,
{
    fn pool(&mut self) -> OspreyResult<&mut WorkerPool<I, O>> {
        self.workers
            .as_mut()
            .ok_or_else(|| OspreyError::Internal("parallel section used outside its phase".into()))
    }

    /// Receive one completed batch, blocking until a worker finishes.
    fn drain_one(&mut self) -> OspreyResult<()> {
        let (seq, result) = self
            .pool()?
            .output
            .recv()
            .map_err(|_| OspreyError::Internal("all parallel workers exited early".into()))?;
        let outputs = result?;
        deliver(
            &mut self.dest,
            &mut self.reorder,
            &mut self.next_emit,
            self.policy.maintain_order,
            seq,
            outputs,
        )
    }

    /// Receive without blocking; true if something was processed.
    fn drain_ready(&mut self) -> OspreyResult<bool> {
        let mut any = false;
        loop {
            let received = self.pool()?.output.try_recv();
            match received {
                Ok((seq, result)) => {
                    let outputs = result?;
                    deliver(
                        &mut self.dest,
                        &mut self.reorder,
                        &mut self.next_emit,
                        self.policy.maintain_order,
                        seq,
                        outputs,
                    )?;
                    any = true;
                }
                Err(_) => return Ok(any),
            }
        }
    }

    /// Hand the current buffer to a worker, applying backpressure by
    /// draining completed batches while every worker is busy.
    fn dispatch(&mut self) -> OspreyResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.drain_ready()?;
        let seq = self.send_seq;
        self.send_seq += 1;
        let mut batch = (seq, std::mem::take(&mut self.buffer));
        loop {
            let pool = self.pool()?;
            let n = pool.inputs.len();
            let mut sent = false;
            for _ in 0..n {
                let w = pool.next_worker;
                pool.next_worker = (w + 1) % n;
                match pool.inputs[w].try_send(batch) {
                    Ok(()) => {
                        sent = true;
                        break;
                    }
                    Err(TrySendError::Full(b)) => batch = b,
                    Err(TrySendError::Disconnected(_)) => {
                        return Err(OspreyError::Internal(
                            "parallel worker exited early".into(),
                        ));
                    }
                }
            }
            if sent {
                return Ok(());
            }
            // Every worker queue is full: wait for one batch to complete.
            self.drain_one()?;
        }
    }
}

impl<I, O, F, D> Push for Parallel<I, O, F, D>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Factory<Collector<O>> + Clone + Send + 'static,
    F::Built: Push<Item = I> + ControlFlow + Send + 'static,
    D: Push<Item = O> + Operator,
{
    type Item = I;

    fn push(&mut self, item: I) -> OspreyResult<()> {
        self.buffer.push(item);
        if self.buffer.len() >= self.policy.buffer_items {
            self.dispatch()?;
        }
        Ok(())
    }
}

impl<I, O, F, D> Operator for Parallel<I, O, F, D>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Factory<Collector<O>> + Clone + Send + 'static,
    F::Built: Push<Item = I> + ControlFlow + Send + 'static,
    D: Push<Item = O> + Operator,
{
    fn token(&self) -> &Token {
        &self.token
    }

    fn begin(&mut self) -> OspreyResult<()> {
        let factory = self
            .inner
            .take()
            .ok_or_else(|| OspreyError::Internal("parallel section begun twice".into()))?;
        let workers = self.policy.effective_workers();
        let (out_tx, out_rx) = std::sync::mpsc::sync_channel(workers * 2);
        let mut inputs = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (in_tx, in_rx) = std::sync::mpsc::sync_channel::<Batch<I>>(1);
            let out = out_tx.clone();
            let f = factory.clone();
            handles.push(std::thread::spawn(move || worker_loop(f, in_rx, out)));
            inputs.push(in_tx);
        }
        self.workers = Some(WorkerPool {
            inputs,
            output: out_rx,
            handles,
            next_worker: 0,
        });
        Ok(())
    }

    fn end(&mut self) -> OspreyResult<()> {
        self.dispatch()?;
        let Some(mut pool) = self.workers.take() else {
            return Ok(());
        };
        // Closing the input channels lets the workers drain and exit.
        pool.inputs.clear();
        let mut first_error = None;
        for (seq, result) in pool.output.iter() {
            match result {
                Ok(outputs) => {
                    if first_error.is_none() {
                        if let Err(err) = deliver(
                            &mut self.dest,
                            &mut self.reorder,
                            &mut self.next_emit,
                            self.policy.maintain_order,
                            seq,
                            outputs,
                        ) {
                            first_error = Some(err);
                        }
                    }
                }
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => {
                    tracing::warn!(%err, "suppressed parallel worker error");
                }
            }
        }
        for handle in pool.handles {
            if handle.join().is_err() {
                tracing::warn!("parallel worker panicked");
            }
        }
        debug_assert!(
            first_error.is_some() || self.reorder.is_empty(),
            "reorder buffer drained at end"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<I, O, F, D> ControlFlow for Parallel<I, O, F, D>
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
