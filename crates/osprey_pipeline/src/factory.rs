//! Composition machinery.
//!
//! A *factory* carries an operator's constructor payload and builds the
//! concrete node once its downstream is known, so a chain of factories
//! fuses into one monomorphized object. `A | B` composes factories;
//! composing with a terminator yields a complete chain specification that
//! `Pipeline::add` can build.
//!
//! Push chains build sink-first: the rightmost factory builds, its node
//! becomes the destination for the one to its left. Pull chains build
//! source-first, mirrored.

use std::ops::BitOr;

/// Builds a node given its downstream (push) or upstream (pull) peer.
pub trait Factory<D> {
    type Built;
    fn build(self, dest: D) -> Self::Built;
}

/// Builds a node with no peer argument: the end of a push chain or the
/// source of a pull chain.
pub trait TerminalFactory {
    type Built;
    fn build(self) -> Self::Built;
}

/// Composition of two factories; building threads the right factory's node
/// into the left one.
#[derive(Clone)]
pub struct Pipe<F1, F2> {
    pub first: F1,
    pub second: F2,
}

impl<D, F1, F2> Factory<D> for Pipe<F1, F2>
where
    F2: Factory<D>,
    F1: Factory<F2::Built>,
{
    type Built = F1::Built;

    fn build(self, dest: D) -> Self::Built {
        self.first.build(self.second.build(dest))
    }
}

/// A factory closed off with a terminator; itself a terminal factory, so
/// chains can keep growing from the open side.
pub struct Terminated<F, T> {
    pub factory: F,
    pub terminal: T,
}

impl<F, T> TerminalFactory for Terminated<F, T>
where
    T: TerminalFactory,
    F: Factory<T::Built>,
{
    type Built = F::Built;

    fn build(self) -> Self::Built {
        self.factory.build(self.terminal.build())
    }
}

// ── User-facing wrappers ─────────────────────────────────────────────────────

/// A push-chain fragment that still needs a downstream.
pub struct PipeMiddle<F>(pub F);

/// A completed chain specification (or a bare sink): ready for
/// `Pipeline::add`.
pub struct PipeEnd<T>(pub T);

/// The producing end of a pull chain.
pub struct PullSource<T>(pub T);

/// A pull-chain fragment that still needs an upstream.
pub struct PullMiddle<F>(pub F);

/// The consuming, initiating end of a pull chain.
pub struct PullEnd<F>(pub F);

impl<F1, F2> BitOr<PipeMiddle<F2>> for PipeMiddle<F1> {
    type Output = PipeMiddle<Pipe<F1, F2>>;

    fn bitor(self, rhs: PipeMiddle<F2>) -> Self::Output {
        PipeMiddle(Pipe {
            first: self.0,
            second: rhs.0,
        })
    }
}

impl<F, T> BitOr<PipeEnd<T>> for PipeMiddle<F> {
    type Output = PipeEnd<Terminated<F, T>>;

    fn bitor(self, rhs: PipeEnd<T>) -> Self::Output {
        PipeEnd(Terminated {
            factory: self.0,
            terminal: rhs.0,
        })
    }
}

impl<T, F> BitOr<PullMiddle<F>> for PullSource<T> {
    type Output = PullSource<Terminated<F, T>>;

    fn bitor(self, rhs: PullMiddle<F>) -> Self::Output {
        PullSource(Terminated {
            factory: rhs.0,
            terminal: self.0,
        })
    }
}

impl<T, F> BitOr<PullEnd<F>> for PullSource<T> {
    type Output = PipeEnd<Terminated<F, T>>;

    fn bitor(self, rhs: PullEnd<F>) -> Self::Output {
        PipeEnd(Terminated {
            factory: rhs.0,
            terminal: self.0,
        })
    }
}
