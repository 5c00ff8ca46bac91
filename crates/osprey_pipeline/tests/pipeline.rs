//! End-to-end pipeline runs: fusion, phases, forwarding, parallelism.

use osprey_common::error::{OspreyError, OspreyResult};
use osprey_common::progress::NullProgress;
use osprey_common::Runtime;
use osprey_pipeline::factory::{Factory, PipeMiddle};
use osprey_pipeline::graph::ITEMS_KEY;
use osprey_pipeline::node::{ControlFlow, Operator, Push};
use osprey_pipeline::operators::{
    input, item_source, map, output, passive_reverser, pull_input, pull_map, pull_output,
    sort_pipe, sum_sink, vec_sink, SinkHandle,
};
use osprey_pipeline::parallel::{parallel, ParallelPolicy};
use osprey_pipeline::tokens::Token;
use osprey_pipeline::virtual_chunk::VirtualChunk;
use osprey_pipeline::Pipeline;
use osprey_stream::{Stream, StreamOptions};

const MEM: u64 = 16 * 1024 * 1024;

fn run(pipeline: &mut Pipeline, items: u64) -> OspreyResult<()> {
    let mut progress = NullProgress;
    pipeline.run(items, &mut progress, MEM)
}

#[test]
fn map_sum_over_a_million_items() {
    let rt = Runtime::default();
    let n: u64 = 1_000_000;
    let (sum, total) = sum_sink::<u64>();
    let mut p = Pipeline::new(&rt);
    p.add(item_source(1..=n) | map(|x: u64| 2 * x) | sum);
    run(&mut p, n).unwrap();
    assert_eq!(*total.lock(), n * (n + 1));
    assert_eq!(*total.lock(), 1_000_001_000_000);
}

#[test]
fn two_phase_reverser() {
    let rt = Runtime::default();
    let (rev_sink, rev_source) = passive_reverser::<u64>();
    let (collect, out) = vec_sink::<u64>();
    let mut p = Pipeline::new(&rt);
    p.add(item_source(0..1000u64) | rev_sink);
    p.add(rev_source | collect);

    // Both phases are visible in the schedule, producer first.
    let plan = p.plan().unwrap();
    assert_eq!(plan.phases.len(), 2);
    assert_eq!(plan.phases[0].name, "reverser input");
    assert_eq!(plan.phases[1].name, "reverser output");

    run(&mut p, 1000).unwrap();
    let expect: Vec<u64> = (0..1000u64).rev().collect();
    assert_eq!(*out.lock(), expect);
}

#[test]
fn plan_is_deterministic_across_calls() {
    let rt = Runtime::default();
    let (rev_sink, rev_source) = passive_reverser::<u64>();
    let (collect, _out) = vec_sink::<u64>();
    let mut p = Pipeline::new(&rt);
    p.add(item_source(0..10u64) | rev_sink);
    p.add(rev_source | collect);
    let a = p.plan().unwrap();
    let b = p.plan().unwrap();
    let names =
        |plan: &osprey_pipeline::graph::PhasePlan| -> Vec<String> {
            plan.phases.iter().map(|ph| ph.name.clone()).collect()
        };
    assert_eq!(names(&a), names(&b));
}

// ── A probe operator exercising the forwarding contract ─────────────────────

struct ProbeFactory {
    seen: SinkHandle<Option<u64>>,
}

impl<D: Push<Item = u64> + Operator> Factory<D> for ProbeFactory {
    type Built = Probe<D>;

    fn build(self, dest: D) -> Self::Built {
        let token = Token::new("probe");
        token.add_push_destination(dest.token());
        Probe {
            token,
            seen: self.seen,
            dest,
        }
    }
}

struct Probe<D> {
    token: Token,
    seen: SinkHandle<Option<u64>>,
    dest: D,
}

impl<D: Push<Item = u64>> Push for Probe<D> {
    type Item = u64;

    fn push(&mut self, item: u64) -> OspreyResult<()> {
        self.dest.push(item)
    }
}

impl<D: Push<Item = u64> + Operator> Operator for Probe<D> {
    fn token(&self) -> &Token {
        &self.token
    }

    fn begin(&mut self) -> OspreyResult<()> {
        *self.seen.lock() = self.token.fetch::<u64>(ITEMS_KEY);
        Ok(())
    }
}

impl<D: Push<Item = u64> + Operator + ControlFlow> ControlFlow for Probe<D> {
    fn visit(&mut self, f: &mut dyn FnMut(&mut dyn Operator) -> bool) -> bool {
        if f(self) {
            return true;
        }
        self.dest.visit(f)
    }
}

#[test]
fn forwarded_item_count_reaches_downstream_begin() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::default();
    let path = dir.path().join("items.osp");
    let mut s: Stream<u64> = Stream::create_with(
        &rt,
        &path,
        StreamOptions {
            block_items: Some(64),
            ..StreamOptions::default()
        },
    )
    .unwrap();
    for i in 0..500u64 {
        s.write_item(i).unwrap();
    }

    let seen: SinkHandle<Option<u64>> = SinkHandle::default();
    let (collect, out) = vec_sink::<u64>();
    let mut p = Pipeline::new(&rt);
    p.add(input(s) | PipeMiddle(ProbeFactory { seen: seen.clone() }) | collect);
    // The stream's own size wins over the caller's estimate.
    run(&mut p, 1).unwrap();
    assert_eq!(*seen.lock(), Some(500));
    assert_eq!(out.lock().len(), 500);
}

#[test]
fn stream_to_stream_copy() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::default();
    let src_path = dir.path().join("src.osp");
    let dst_path = dir.path().join("dst.osp");
    let mut src: Stream<u32> = Stream::create(&rt, &src_path).unwrap();
    for i in 0..10_000u32 {
        src.write_item(i * 7).unwrap();
    }
    let dst: Stream<u32> = Stream::create(&rt, &dst_path).unwrap();

    let mut p = Pipeline::new(&rt);
    p.add(input(src) | map(|x: u32| x + 1) | output(dst));
    run(&mut p, 10_000).unwrap();

    let mut check: Stream<u32> = Stream::open_ro(&rt, &dst_path).unwrap();
    assert_eq!(check.size(), 10_000);
    for i in 0..10_000u32 {
        assert_eq!(check.read_item().unwrap(), i * 7 + 1);
    }
}

#[test]
fn pull_chain_copies_and_transforms() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::default();
    let src_path = dir.path().join("src.osp");
    let dst_path = dir.path().join("dst.osp");
    let mut src: Stream<u64> = Stream::create(&rt, &src_path).unwrap();
    for i in 0..5_000u64 {
        src.write_item(i).unwrap();
    }
    src.seek_item(0).unwrap();
    let dst: Stream<u64> = Stream::create(&rt, &dst_path).unwrap();

    let mut p = Pipeline::new(&rt);
    p.add(pull_input(src) | pull_map(|x: u64| x * 2) | pull_output(dst));
    run(&mut p, 5_000).unwrap();

    let mut check: Stream<u64> = Stream::open_ro(&rt, &dst_path).unwrap();
    assert_eq!(check.size(), 5_000);
    for i in 0..5_000u64 {
        assert_eq!(check.read_item().unwrap(), i * 2);
    }
}

#[test]
fn sort_pipe_runs_in_two_phases() {
    let rt = Runtime::default();
    let input_data: Vec<u64> = (0..50_000u64).map(|i| (i * 2_654_435_761) % 100_000).collect();
    let mut expected = input_data.clone();
    expected.sort_unstable();

    let (sort_sink, sort_source) = sort_pipe::<u64>(&rt, 12, |a, b| a.cmp(b));
    let (collect, out) = vec_sink::<u64>();
    let mut p = Pipeline::new(&rt);
    p.add(item_source(input_data.into_iter()) | sort_sink);
    p.add(sort_source | collect);

    let plan = p.plan().unwrap();
    assert_eq!(plan.phases.len(), 2);

    run(&mut p, 50_000).unwrap();
    assert_eq!(*out.lock(), expected);
}

#[test]
fn parallel_preserves_order_when_asked() {
    let rt = Runtime::default();
    let n = 50_000u32;
    let (collect, out) = vec_sink::<u32>();
    let policy = ParallelPolicy {
        maintain_order: true,
        workers: 4,
        buffer_items: 64,
    };
    let mut p = Pipeline::new(&rt);
    p.add(item_source(0..n) | parallel(map(|x: u32| x.wrapping_mul(3)), policy) | collect);
    run(&mut p, n as u64).unwrap();
    let expect: Vec<u32> = (0..n).map(|x| x.wrapping_mul(3)).collect();
    assert_eq!(*out.lock(), expect);
}

#[test]
fn parallel_unordered_is_a_permutation() {
    let rt = Runtime::default();
    let n = 20_000u32;
    let (collect, out) = vec_sink::<u32>();
    let policy = ParallelPolicy {
        maintain_order: false,
        workers: 3,
        buffer_items: 128,
    };
    let mut p = Pipeline::new(&rt);
    p.add(item_source(0..n) | parallel(map(|x: u32| x + 1), policy) | collect);
    run(&mut p, n as u64).unwrap();
    let mut got = out.lock().clone();
    got.sort_unstable();
    let expect: Vec<u32> = (1..=n).collect();
    assert_eq!(got, expect);
}

#[test]
fn virtual_chunks_compose_by_type() {
    let rt = Runtime::default();
    let double = VirtualChunk::<u64, u64>::new(map(|x: u64| x * 2));
    let add_one = VirtualChunk::<u64, u64>::new(map(|x: u64| x + 1));
    let fused = double | add_one;

    let (sum, total) = sum_sink::<u64>();
    let mut p = Pipeline::new(&rt);
    p.add(item_source(1..=100u64) | fused.into_middle() | sum);
    run(&mut p, 100).unwrap();
    // sum of (2x + 1) for x in 1..=100
    assert_eq!(*total.lock(), 2 * (100 * 101 / 2) + 100);
}

// ── Failure unwinding ────────────────────────────────────────────────────────

struct FailingSinkFactory {
    fail_after: u64,
    ended: SinkHandle<bool>,
}

impl osprey_pipeline::factory::TerminalFactory for FailingSinkFactory {
    type Built = FailingSink;

    fn build(self) -> Self::Built {
        FailingSink {
            token: Token::new("failing sink"),
            remaining: self.fail_after,
            ended: self.ended,
        }
    }
}

struct FailingSink {
    token: Token,
    remaining: u64,
    ended: SinkHandle<bool>,
}

impl Push for FailingSink {
    type Item = u64;

    fn push(&mut self, _item: u64) -> OspreyResult<()> {
        if self.remaining == 0 {
            return Err(OspreyError::Internal("sink gave up".into()));
        }
        self.remaining -= 1;
        Ok(())
    }
}

impl Operator for FailingSink {
    fn token(&self) -> &Token {
        &self.token
    }

    fn end(&mut self) -> OspreyResult<()> {
        *self.ended.lock() = true;
        Ok(())
    }
}

impl ControlFlow for FailingSink {
    fn visit(&mut self, f: &mut dyn FnMut(&mut dyn Operator) -> bool) -> bool {
        f(self)
    }
}

#[test]
fn failing_phase_still_ends_begun_nodes() {
    let rt = Runtime::default();
    let ended: SinkHandle<bool> = SinkHandle::default();
    let mut p = Pipeline::new(&rt);
    p.add(
        item_source(0..1_000u64)
            | osprey_pipeline::PipeEnd(FailingSinkFactory {
                fail_after: 10,
                ended: ended.clone(),
            }),
    );
    let err = run(&mut p, 1_000).unwrap_err();
    assert!(matches!(err, OspreyError::Internal(_)));
    // Cleanup ran despite the failure.
    assert!(*ended.lock());
}

#[test]
fn plot_mentions_every_node() {
    let rt = Runtime::default();
    let (sum, _total) = sum_sink::<u64>();
    let mut p = Pipeline::new(&rt);
    p.add(item_source(0..10u64) | map(|x: u64| x) | sum);
    let mut dot = Vec::new();
    p.plot(&mut dot).unwrap();
    let dot = String::from_utf8(dot).unwrap();
    assert!(dot.contains("item source"));
    assert!(dot.contains("map"));
    assert!(dot.contains("sum"));
    let mut phases = Vec::new();
    p.plot_phases(&mut phases).unwrap();
    assert!(String::from_utf8(phases).unwrap().contains("digraph phases"));
}
