/*!
 * Tape based reverse mode automatic differentiation.
 *
 * A [Tape] records every primitive operation performed while a model computes a scalar from
 * its parameters, then replays those operations backwards in [gradient](Tape::gradient) to
 * find the partial derivatives of the scalar with respect to each parameter.
 *
 * Storage on the tape is an arena of numbered cells. A [Location] is a handle to one of these
 * cells, and two Locations are equal exactly when they refer to the same cell, regardless of
 * the values held. Operations name their result and operand cells by Location, so aliasing
 * such as `u / u` or `v = v` is always explicit.
 *
 * Differentiated calls nest. [enter](Tape::enter) opens a frame and the matching
 * [gradient](Tape::gradient) closes it, releasing everything recorded or allocated inside. A
 * model can therefore call into other differentiated functions, each with its own frame, and
 * get back a gradient with respect to only the callee's own parameters. A nested call can
 * instead end with [leave](Tape::leave), which closes its frame but keeps its records, so
 * the caller's gradient flows through the call. That is how differentiable sub-models compose.
 *
 * ```
 * use easy_ad::tape::{Op, Tape};
 * // f(x, y) = x * y + x
 * let mut tape = Tape::new();
 * let parameters = tape.setup(&[3.0, 5.0]).unwrap();
 * let (x, y) = (parameters[0], parameters[1]);
 * let xy = tape.cell(0.0).unwrap();
 * let xy = tape.arithmetic(Op::Mul, xy, &[x, y]).unwrap();
 * let f = tape.cell(0.0).unwrap();
 * let f = tape.arithmetic(Op::Add, f, &[xy, x]).unwrap();
 * assert_eq!(tape.ret(f).unwrap(), 18.0);
 * // df/dx = y + 1, df/dy = x
 * assert_eq!(tape.gradient().unwrap(), vec![6.0, 3.0]);
 * ```
 *
 * A tape is only ever written by one thread at a time. While a frame is open the tape
 * remembers which thread opened it and rejects access from any other with
 * [ConcurrentTapeMutation](TapeError::ConcurrentTapeMutation). To evaluate on several threads
 * at once give each its own tape, directly or through the [store](crate::store).
 */

use crate::config::TapeConfig;
use crate::elementals::Derivative;
use crate::errors::TapeError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::thread::{self, ThreadId};

mod backward;
mod forward;

/**
 * A handle to a scalar storage cell on a [Tape].
 *
 * Locations are only created by the tape, and stay valid until the frame they were allocated
 * in is popped.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Location(usize);

impl Location {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/**
 * The arithmetic operators the tape differentiates directly.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Op {
    Neg,
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    /**
     * The number of operands the operator takes.
     */
    pub fn arity(self) -> usize {
        match self {
            Op::Neg => 1,
            Op::Add | Op::Sub | Op::Mul | Op::Div => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Op::Neg => "negation",
            Op::Add => "addition",
            Op::Sub => "subtraction",
            Op::Mul => "multiplication",
            Op::Div => "division",
        }
    }

    /**
     * Computes the operator on operand values, `operands` must have [arity](Op::arity)
     * elements.
     */
    pub(crate) fn apply(self, operands: &[f64]) -> f64 {
        match self {
            Op::Neg => -operands[0],
            Op::Add => operands[0] + operands[1],
            Op::Sub => operands[0] - operands[1],
            Op::Mul => operands[0] * operands[1],
            Op::Div => operands[0] / operands[1],
        }
    }

    /**
     * The local partial derivatives of the operator with respect to each operand, for
     * operand values `u` and `w` (`w` is ignored for negation).
     */
    pub(crate) fn partials(self, u: f64, w: f64) -> [f64; 2] {
        match self {
            // δ(-u) / δu = -1
            Op::Neg => [-1.0, 0.0],
            // δ(u + w) / δu = 1, δ(u + w) / δw = 1
            Op::Add => [1.0, 1.0],
            // δ(u - w) / δu = 1, δ(u - w) / δw = -1
            Op::Sub => [1.0, -1.0],
            // δ(u * w) / δu = w, δ(u * w) / δw = u
            Op::Mul => [w, u],
            // δ(u / w) / δu = 1 / w, δ(u / w) / δw = -u / w^2
            Op::Div => [1.0 / w, -u / (w * w)],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Kind {
    /// `places: [dst, src]`, `values: [dst before]`
    Assignment,
    /// `places: [result, operands..]`, `values: [result before]`
    Arithmetic(Op),
    /// `places: [result, arguments..]`, `values: [result before, result, arguments..]`,
    /// the index is into the tape's elemental calls
    Elemental(usize),
}

/**
 * One recorded operation, with the offsets of its operands in the places and values arrays.
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Record {
    pub(crate) kind: Kind,
    pub(crate) places: usize,
    pub(crate) values: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct ElementalCall {
    pub(crate) arity: usize,
    pub(crate) derivative: Derivative,
}

impl fmt::Debug for ElementalCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementalCall")
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/**
 * The lengths of the tape's arrays when a frame was entered, which are restored when it is
 * popped.
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Frame {
    pub(crate) records: usize,
    pub(crate) places: usize,
    pub(crate) values: usize,
    pub(crate) calls: usize,
    pub(crate) cells: usize,
    /// number of parameters declared by enter
    pub(crate) parameters: usize,
    /// number of parameters registered with variable so far
    pub(crate) declared: usize,
    pub(crate) result: Option<Location>,
    /// set when a nested frame is differentiated, cleared by the next recording in this one
    pub(crate) child_popped: bool,
}

/**
 * The recording of a forward pass and the scope stack of frames over it.
 *
 * See the [module level documentation](self) for an overview.
 */
#[derive(Debug)]
pub struct Tape {
    pub(crate) cells: Vec<f64>,
    pub(crate) records: Vec<Record>,
    pub(crate) places: Vec<Location>,
    pub(crate) values: Vec<f64>,
    pub(crate) calls: Vec<ElementalCall>,
    pub(crate) frames: Vec<Frame>,
    // only populated during a backward pass
    pub(crate) bars: HashMap<Location, f64>,
    owner: Option<ThreadId>,
    check_owner: bool,
    // set when a gradient pops the last frame, cleared by enter
    pub(crate) popped: bool,
    // set for the duration of a backward pass, still set afterwards only if it panicked
    pub(crate) replaying: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Tape::new()
    }
}

impl Tape {
    /**
     * Creates a new empty tape with the default [TapeConfig].
     */
    pub fn new() -> Tape {
        Tape::with_config(TapeConfig::default())
    }

    pub fn with_config(config: TapeConfig) -> Tape {
        Tape {
            cells: Vec::with_capacity(config.cells_capacity),
            records: Vec::with_capacity(config.records_capacity),
            places: Vec::with_capacity(config.records_capacity * 2),
            values: Vec::with_capacity(config.values_capacity),
            calls: Vec::new(),
            frames: Vec::new(),
            bars: HashMap::new(),
            owner: None,
            check_owner: config.check_owner,
            popped: false,
            replaying: false,
        }
    }

    /**
     * Opens a new frame for a differentiated call with `parameters` inputs.
     *
     * The inputs must then be registered with [variable](Tape::variable) in order, before
     * anything else is recorded in the frame. Every enter must be matched by exactly one
     * [gradient](Tape::gradient), [leave](Tape::leave) or [abandon](Tape::abandon).
     */
    pub fn enter(&mut self, parameters: usize) -> Result<(), TapeError> {
        self.check_owner()?;
        if self.frames.is_empty() {
            self.owner = Some(thread::current().id());
        }
        self.frames.push(Frame {
            records: self.records.len(),
            places: self.places.len(),
            values: self.values.len(),
            calls: self.calls.len(),
            cells: self.cells.len(),
            parameters,
            declared: 0,
            result: None,
            child_popped: false,
        });
        self.popped = false;
        tracing::trace!(depth = self.frames.len(), parameters, "entered frame");
        Ok(())
    }

    /**
     * Pops the current frame without computing its gradient, releasing everything it
     * recorded. Use this to discard an evaluation that failed part way through.
     */
    pub fn abandon(&mut self) -> Result<(), TapeError> {
        self.check_owner()?;
        let frame = *self.frames.last().ok_or(TapeError::FrameStackUnderflow)?;
        tracing::warn!(
            depth = self.frames.len(),
            records = self.records.len() - frame.records,
            "abandoned frame"
        );
        self.pop(frame);
        Ok(())
    }

    /**
     * Closes the current frame without differentiating it, keeping everything it recorded
     * and allocated as part of the enclosing frame. Returns the value of `result`.
     *
     * The enclosing frame's [gradient](Tape::gradient) then replays the call's records
     * along with its own, so derivatives flow from `result` back through the call into
     * whatever it read. A nested call that registers the caller's locations as its
     * variables composes exactly like inline code. `result` and every other cell the call
     * allocated stay valid until the enclosing frame is popped.
     *
     * Fails with [FrameStackUnderflow](TapeError::FrameStackUnderflow) unless there is an
     * enclosing frame to keep the records in.
     */
    pub fn leave(&mut self, result: Location) -> Result<f64, TapeError> {
        self.check_owner()?;
        if self.frames.len() < 2 {
            return Err(TapeError::FrameStackUnderflow);
        }
        self.live(result)?;
        self.frames.pop();
        self.touch();
        tracing::trace!(depth = self.frames.len(), "left frame");
        Ok(self.cells[result.index()])
    }

    /**
     * Discards every frame and all storage, returning the tape to its newly created state.
     * Any Location handed out before is invalidated.
     *
     * This is also the way to recover a tape whose backward pass panicked.
     */
    pub fn reset(&mut self) -> Result<(), TapeError> {
        self.check_thread()?;
        self.clear();
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.cells.clear();
        self.records.clear();
        self.places.clear();
        self.values.clear();
        self.calls.clear();
        self.frames.clear();
        self.bars.clear();
        self.owner = None;
        self.popped = false;
        self.replaying = false;
    }

    /**
     * The number of open frames.
     */
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /**
     * The number of operations recorded across all open frames.
     */
    pub fn recorded(&self) -> usize {
        self.records.len()
    }

    /**
     * The number of live cells.
     */
    pub fn cells(&self) -> usize {
        self.cells.len()
    }

    /**
     * Truncates every array back to the frame's boundaries and forgets the adjoints of
     * every location the frame touched.
     */
    pub(crate) fn pop(&mut self, frame: Frame) {
        for location in &self.places[frame.places..] {
            self.bars.remove(location);
        }
        if let Some(result) = frame.result {
            self.bars.remove(&result);
        }
        self.records.truncate(frame.records);
        self.places.truncate(frame.places);
        self.values.truncate(frame.values);
        self.calls.truncate(frame.calls);
        self.cells.truncate(frame.cells);
        self.frames.pop();
        if self.frames.is_empty() {
            self.owner = None;
        }
        tracing::trace!(depth = self.frames.len(), "popped frame");
    }

    /**
     * Marks the current frame as having recorded something since its last nested gradient.
     */
    pub(crate) fn touch(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.child_popped = false;
        }
    }

    /**
     * Checks the tape may be used by the calling thread, and was not left half replayed.
     */
    pub(crate) fn check_owner(&self) -> Result<(), TapeError> {
        if self.replaying {
            return Err(TapeError::InterruptedReplay);
        }
        self.check_thread()
    }

    fn check_thread(&self) -> Result<(), TapeError> {
        if !self.check_owner {
            return Ok(());
        }
        match self.owner {
            Some(owner) => {
                let accessor = thread::current().id();
                if owner == accessor {
                    Ok(())
                } else {
                    Err(TapeError::ConcurrentTapeMutation { owner, accessor })
                }
            }
            None => Ok(()),
        }
    }

    pub(crate) fn frame(&self) -> Result<&Frame, TapeError> {
        self.frames.last().ok_or(TapeError::FrameStackUnderflow)
    }

    pub(crate) fn frame_mut(&mut self) -> Result<&mut Frame, TapeError> {
        self.frames.last_mut().ok_or(TapeError::FrameStackUnderflow)
    }

    pub(crate) fn live(&self, location: Location) -> Result<(), TapeError> {
        if location.0 < self.cells.len() {
            Ok(())
        } else {
            Err(TapeError::InvalidLocation { location })
        }
    }

    pub(crate) fn allocate(&mut self, value: f64) -> Location {
        self.cells.push(value);
        Location(self.cells.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elementals::{self, Elemental};

    #[test]
    fn pop_restores_lengths() {
        let mut tape = Tape::new();
        let outer = tape.setup(&[1.0]).unwrap();
        let before = (tape.records.len(), tape.places.len(), tape.values.len(), tape.cells.len());
        tape.enter(0).unwrap();
        let a = tape.constant(2.0).unwrap();
        let b = tape.cell(0.0).unwrap();
        tape.arithmetic(Op::Mul, b, &[a, outer[0]]).unwrap();
        tape.elemental(&elementals::EXP, b, &[b]).unwrap();
        tape.ret(b).unwrap();
        tape.gradient().unwrap();
        let after = (tape.records.len(), tape.places.len(), tape.values.len(), tape.cells.len());
        assert_eq!(before, after);
        assert!(tape.calls.is_empty());
        assert!(tape.bars.is_empty());
        assert_eq!(tape.depth(), 1);
    }

    #[test]
    fn bars_are_empty_after_every_gradient() {
        let mut tape = Tape::new();
        let x = tape.setup(&[0.5, 2.0]).unwrap();
        let y = tape.cell(0.0).unwrap();
        tape.arithmetic(Op::Div, y, &[x[0], x[1]]).unwrap();
        tape.assignment(y, y).unwrap();
        tape.ret(y).unwrap();
        tape.gradient().unwrap();
        assert!(tape.bars.is_empty());
        assert!(tape.owner.is_none());
    }

    fn unregistered(x: &[f64]) -> f64 {
        x[0]
    }

    #[test]
    fn unregistered_elemental_records_nothing() {
        const MISSING: Elemental = Elemental::new("tape::tests::missing", 1, unregistered);
        let mut tape = Tape::new();
        let x = tape.setup(&[1.0]).unwrap();
        let lengths = (tape.records.len(), tape.places.len(), tape.values.len(), tape.calls.len());
        let y = tape.cell(0.0).unwrap();
        assert_eq!(
            tape.elemental(&MISSING, y, &[x[0]]),
            Err(TapeError::UnregisteredElemental {
                name: "tape::tests::missing"
            })
        );
        assert_eq!(
            lengths,
            (tape.records.len(), tape.places.len(), tape.values.len(), tape.calls.len())
        );
        tape.abandon().unwrap();
        assert_eq!(tape.depth(), 0);
        assert_eq!(tape.cells(), 0);
    }

    #[test]
    fn other_threads_are_rejected_while_a_frame_is_open() {
        let mut tape = Tape::new();
        tape.enter(0).unwrap();
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let error = tape.enter(0).unwrap_err();
                    assert!(matches!(error, TapeError::ConcurrentTapeMutation { .. }));
                })
                .join()
                .unwrap();
        });
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    assert!(matches!(
                        tape.cell(1.0),
                        Err(TapeError::ConcurrentTapeMutation { .. })
                    ));
                    assert!(matches!(
                        tape.reset(),
                        Err(TapeError::ConcurrentTapeMutation { .. })
                    ));
                })
                .join()
                .unwrap();
        });
        assert_eq!(tape.depth(), 1);
        tape.abandon().unwrap();
        // with no frames open the tape can move
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    tape.enter(0).unwrap();
                    tape.abandon().unwrap();
                })
                .join()
                .unwrap();
        });
    }
}
