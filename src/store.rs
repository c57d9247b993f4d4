/*!
 * Tapes shared through the process rather than passed around explicitly.
 *
 * Code that cannot thread a [Tape] through its calls can record onto the *current* tape with
 * the free functions in this module, which mirror the methods of [Tape].
 *
 * By default the current tape is a single process wide tape. That is fine for evaluating on
 * one thread, and a second thread that tries to record while the first has a frame open is
 * rejected with [ConcurrentTapeMutation](TapeError::ConcurrentTapeMutation). Calling
 * [enable_multi_context] switches every thread over to a tape of its own, created the first
 * time the thread records anything. Once enabled this cannot be turned off again, since other
 * threads may already be partway through an evaluation on their own tapes.
 *
 * ```
 * use easy_ad::store;
 * use easy_ad::tape::Op;
 * store::enable_multi_context();
 * let handles: Vec<_> = (1..=4).map(|i| std::thread::spawn(move || {
 *     // f(x) = i * x
 *     let x = store::setup(&[2.0]).unwrap();
 *     let i = store::constant(i as f64).unwrap();
 *     let y = store::cell(0.0).unwrap();
 *     let y = store::arithmetic(Op::Mul, y, &[i, x[0]]).unwrap();
 *     store::ret(y).unwrap();
 *     let gradient = store::gradient().unwrap();
 *     store::drop_tape();
 *     gradient
 * })).collect();
 * for (i, handle) in (1..=4).zip(handles) {
 *     assert_eq!(handle.join().unwrap(), vec![i as f64]);
 * }
 * ```
 *
 * A [TapeStore] can also be used directly, keyed by [ContextId]s that need not correspond to
 * threads, such as one per task in a worker pool.
 *
 * A panic while a tape is locked, for instance in a derivative rule during
 * [gradient](Tape::gradient), poisons that tape's lock. The next access discards everything
 * on the poisoned tape, every open frame included, before handing it out again.
 */

use crate::config::TapeConfig;
use crate::elementals::Elemental;
use crate::errors::TapeError;
use crate::tape::{Location, Op, Tape};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/**
 * An opaque identifier of an execution context that owns a tape.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CONTEXT: ContextId = ContextId::fresh();
}

impl ContextId {
    /**
     * Creates an identifier distinct from every other one created in this process.
     */
    pub fn fresh() -> ContextId {
        ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    /**
     * The identifier of the calling thread.
     */
    pub fn current() -> ContextId {
        CURRENT_CONTEXT.with(|context| *context)
    }
}

/**
 * A collection of tapes, one per context, created on first use.
 */
#[derive(Debug)]
pub struct TapeStore {
    tapes: DashMap<ContextId, Arc<Mutex<Tape>>>,
    config: TapeConfig,
}

impl Default for TapeStore {
    fn default() -> Self {
        TapeStore::new()
    }
}

impl TapeStore {
    pub fn new() -> TapeStore {
        TapeStore::with_config(TapeConfig::default())
    }

    /**
     * Creates an empty store whose tapes will all be created with `config`.
     */
    pub fn with_config(config: TapeConfig) -> TapeStore {
        TapeStore {
            tapes: DashMap::new(),
            config,
        }
    }

    /**
     * Returns the tape for a context, creating it if this is the context's first use.
     */
    pub fn tape(&self, context: ContextId) -> Arc<Mutex<Tape>> {
        self.tapes
            .entry(context)
            .or_insert_with(|| {
                tracing::debug!(?context, "created tape");
                Arc::new(Mutex::new(Tape::with_config(self.config.clone())))
            })
            .clone()
    }

    /**
     * Runs `f` with exclusive access to the tape of a context.
     */
    pub fn with<R>(&self, context: ContextId, f: impl FnOnce(&mut Tape) -> R) -> R {
        // the map entry is released before locking so other contexts are never blocked
        let tape = self.tape(context);
        let mut tape = lock(&tape);
        f(&mut tape)
    }

    /**
     * Removes a context's tape, returning true if it had one. Any evaluation left open on
     * it is discarded.
     */
    pub fn drop_context(&self, context: ContextId) -> bool {
        let removed = self.tapes.remove(&context).is_some();
        if removed {
            tracing::debug!(?context, "dropped tape");
        }
        removed
    }

    pub fn contains(&self, context: ContextId) -> bool {
        self.tapes.contains_key(&context)
    }

    /**
     * The number of contexts with a tape.
     */
    pub fn len(&self) -> usize {
        self.tapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tapes.is_empty()
    }
}

/**
 * Locks a tape, resetting it first if a panic poisoned the lock part way through a pass.
 */
fn lock(tape: &Mutex<Tape>) -> MutexGuard<'_, Tape> {
    match tape.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            let mut guard = poisoned.into_inner();
            tracing::warn!(
                depth = guard.depth(),
                recorded = guard.recorded(),
                "tape poisoned by a panic, discarding its frames"
            );
            guard.clear();
            tape.clear_poison();
            guard
        }
    }
}

static DEFAULT_TAPE: Lazy<Mutex<Tape>> = Lazy::new(|| Mutex::new(Tape::new()));
static STORE: Lazy<TapeStore> = Lazy::new(TapeStore::new);
static MULTI_CONTEXT: AtomicBool = AtomicBool::new(false);

/**
 * Gives every thread its own tape from now on. Has no effect if already enabled.
 */
pub fn enable_multi_context() {
    if !MULTI_CONTEXT.swap(true, Ordering::AcqRel) {
        tracing::warn!("multi context tapes enabled, this cannot be disabled");
    }
}

pub fn is_multi_context() -> bool {
    MULTI_CONTEXT.load(Ordering::Acquire)
}

/**
 * Runs `f` with exclusive access to the current tape.
 *
 * Calls may not nest, `f` must not call any other function of this module.
 */
pub fn with_tape<R>(f: impl FnOnce(&mut Tape) -> R) -> R {
    if is_multi_context() {
        STORE.with(ContextId::current(), f)
    } else {
        let mut tape = lock(&DEFAULT_TAPE);
        f(&mut tape)
    }
}

/**
 * Drops the calling thread's tape in multi context mode, returning true if it had one.
 * Worker threads should call this before exiting. Does nothing in single context mode.
 */
pub fn drop_tape() -> bool {
    is_multi_context() && STORE.drop_context(ContextId::current())
}

/// See [Tape::enter]
pub fn enter(parameters: usize) -> Result<(), TapeError> {
    with_tape(|tape| tape.enter(parameters))
}

/// See [Tape::setup]
pub fn setup(parameters: &[f64]) -> Result<Vec<Location>, TapeError> {
    with_tape(|tape| tape.setup(parameters))
}

/// See [Tape::cell]
pub fn cell(value: f64) -> Result<Location, TapeError> {
    with_tape(|tape| tape.cell(value))
}

/// See [Tape::constant]
pub fn constant(value: f64) -> Result<Location, TapeError> {
    with_tape(|tape| tape.constant(value))
}

/// See [Tape::value]
pub fn value(location: Location) -> Result<f64, TapeError> {
    with_tape(|tape| tape.value(location))
}

/// See [Tape::variable]
pub fn variable(location: Location) -> Result<Location, TapeError> {
    with_tape(|tape| tape.variable(location))
}

/// See [Tape::assignment]
pub fn assignment(dst: Location, src: Location) -> Result<Location, TapeError> {
    with_tape(|tape| tape.assignment(dst, src))
}

/// See [Tape::arithmetic]
pub fn arithmetic(op: Op, result: Location, operands: &[Location]) -> Result<Location, TapeError> {
    with_tape(|tape| tape.arithmetic(op, result, operands))
}

/// See [Tape::elemental]
pub fn elemental(
    function: &Elemental,
    result: Location,
    operands: &[Location],
) -> Result<Location, TapeError> {
    with_tape(|tape| tape.elemental(function, result, operands))
}

/// See [Tape::ret]
pub fn ret(location: Location) -> Result<f64, TapeError> {
    with_tape(|tape| tape.ret(location))
}

/// See [Tape::gradient]
pub fn gradient() -> Result<Vec<f64>, TapeError> {
    with_tape(|tape| tape.gradient())
}

/// See [Tape::leave]
pub fn leave(result: Location) -> Result<f64, TapeError> {
    with_tape(|tape| tape.leave(result))
}

/// See [Tape::abandon]
pub fn abandon() -> Result<(), TapeError> {
    with_tape(|tape| tape.abandon())
}

/// See [Tape::reset]
pub fn reset() -> Result<(), TapeError> {
    with_tape(|tape| tape.reset())
}
