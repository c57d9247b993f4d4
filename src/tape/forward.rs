/*!
 * The forward pass: operations a model calls on the [Tape] in place of plain arithmetic.
 *
 * Each writing operation computes its value, stores it in the result cell, and appends a
 * record of what it did along with a snapshot of the value the result cell held before the
 * write. The snapshot lets the backward pass put every cell back the way it was at each step
 * as it walks the records in reverse.
 */

use crate::elementals::{self, Elemental};
use crate::errors::TapeError;
use crate::tape::{ElementalCall, Kind, Location, Op, Record, Tape};

impl Tape {
    /**
     * Allocates a new cell holding `value`.
     *
     * Cells allocated while a frame is open are released when that frame is popped, so only
     * the thread that opened the frame may allocate in it.
     */
    pub fn cell(&mut self, value: f64) -> Result<Location, TapeError> {
        self.check_owner()?;
        self.touch();
        Ok(self.allocate(value))
    }

    /**
     * Allocates a new cell holding a constant. Constants are never registered as variables
     * so their adjoints are never read out.
     */
    pub fn constant(&mut self, value: f64) -> Result<Location, TapeError> {
        self.cell(value)
    }

    /**
     * Reads the current value of a cell.
     */
    pub fn value(&self, location: Location) -> Result<f64, TapeError> {
        self.live(location)?;
        Ok(self.cells[location.index()])
    }

    /**
     * Registers a cell as the next parameter of the current frame and returns it unchanged.
     *
     * Parameters must be registered before anything else is recorded in the frame, and no
     * more than were declared by [enter](Tape::enter).
     */
    pub fn variable(&mut self, location: Location) -> Result<Location, TapeError> {
        self.check_owner()?;
        self.live(location)?;
        let places = self.places.len();
        let records = self.records.len();
        let frame = self.frame_mut()?;
        if frame.records != records || frame.places + frame.declared != places {
            return Err(TapeError::LateVariable { location });
        }
        if frame.declared == frame.parameters {
            return Err(TapeError::Arity {
                operation: "variable",
                expected: frame.parameters,
                found: frame.declared + 1,
            });
        }
        frame.declared += 1;
        self.places.push(location);
        self.touch();
        Ok(location)
    }

    /**
     * Opens a frame with one parameter per value, allocating and registering a cell for
     * each. Returns the parameter locations in order.
     */
    pub fn setup(&mut self, parameters: &[f64]) -> Result<Vec<Location>, TapeError> {
        self.enter(parameters.len())?;
        parameters
            .iter()
            .map(|&parameter| {
                let location = self.allocate(parameter);
                self.variable(location)
            })
            .collect()
    }

    /**
     * Records `dst = src`, returning `dst`.
     */
    pub fn assignment(&mut self, dst: Location, src: Location) -> Result<Location, TapeError> {
        self.check_owner()?;
        self.frame()?;
        self.live(dst)?;
        self.live(src)?;
        self.record(Kind::Assignment, dst, &[src], &[]);
        self.cells[dst.index()] = self.cells[src.index()];
        Ok(dst)
    }

    /**
     * Records `result = op(operands)`, returning `result`.
     *
     * [Neg](Op::Neg) takes one operand, every other operator takes two. The result may be
     * one of the operands.
     */
    pub fn arithmetic(
        &mut self,
        op: Op,
        result: Location,
        operands: &[Location],
    ) -> Result<Location, TapeError> {
        self.check_owner()?;
        self.frame()?;
        if operands.len() != op.arity() {
            return Err(TapeError::Arity {
                operation: op.name(),
                expected: op.arity(),
                found: operands.len(),
            });
        }
        self.live(result)?;
        let mut arguments = [0.0; 2];
        for (argument, &operand) in arguments.iter_mut().zip(operands) {
            self.live(operand)?;
            *argument = self.cells[operand.index()];
        }
        let value = op.apply(&arguments);
        self.record(Kind::Arithmetic(op), result, operands, &[]);
        self.cells[result.index()] = value;
        Ok(result)
    }

    /**
     * Records `result = function(operands)` for a registered elemental, returning `result`.
     *
     * Fails with [UnregisteredElemental](TapeError::UnregisteredElemental) before recording
     * anything if the function has no registered derivative, in which case the current
     * frame can still be [abandoned](Tape::abandon).
     */
    pub fn elemental(
        &mut self,
        function: &Elemental,
        result: Location,
        operands: &[Location],
    ) -> Result<Location, TapeError> {
        self.check_owner()?;
        self.frame()?;
        let derivative =
            elementals::lookup(function).ok_or(TapeError::UnregisteredElemental {
                name: function.name(),
            })?;
        if operands.len() != function.arity() {
            return Err(TapeError::Arity {
                operation: function.name(),
                expected: function.arity(),
                found: operands.len(),
            });
        }
        self.live(result)?;
        let mut arguments = Vec::with_capacity(operands.len() + 1);
        for &operand in operands {
            self.live(operand)?;
            arguments.push(self.cells[operand.index()]);
        }
        let value = function.call(&arguments);
        // the backward pass gets the value and arguments from the snapshot, not the cells
        arguments.insert(0, value);
        let call = self.calls.len();
        self.calls.push(ElementalCall {
            arity: function.arity(),
            derivative,
        });
        self.record(Kind::Elemental(call), result, operands, &arguments);
        self.cells[result.index()] = value;
        Ok(result)
    }

    /**
     * Marks `location` as the scalar result of the current frame, the output that
     * [gradient](Tape::gradient) differentiates, and returns its value.
     *
     * This should be the last operation of the frame.
     */
    pub fn ret(&mut self, location: Location) -> Result<f64, TapeError> {
        self.check_owner()?;
        self.live(location)?;
        self.frame_mut()?.result = Some(location);
        self.touch();
        Ok(self.cells[location.index()])
    }

    /**
     * Appends a record writing to `result`, snapshotting the result cell's current value
     * followed by any `extra` values.
     */
    fn record(&mut self, kind: Kind, result: Location, operands: &[Location], extra: &[f64]) {
        let record = Record {
            kind,
            places: self.places.len(),
            values: self.values.len(),
        };
        self.places.push(result);
        self.places.extend_from_slice(operands);
        self.values.push(self.cells[result.index()]);
        self.values.extend_from_slice(extra);
        self.records.push(record);
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_compute_values() {
        let mut tape = Tape::new();
        let x = tape.setup(&[3.0, 4.0]).unwrap();
        let r = tape.cell(0.0).unwrap();
        tape.arithmetic(Op::Sub, r, &[x[0], x[1]]).unwrap();
        assert_eq!(tape.value(r), Ok(-1.0));
        tape.arithmetic(Op::Neg, r, &[r]).unwrap();
        assert_eq!(tape.value(r), Ok(1.0));
        tape.elemental(&elementals::HYPOT, r, &[x[0], x[1]]).unwrap();
        assert_eq!(tape.value(r), Ok(5.0));
        tape.assignment(r, x[1]).unwrap();
        assert_eq!(tape.value(r), Ok(4.0));
        assert_eq!(tape.recorded(), 4);
        // snapshots of r before each write
        assert_eq!(tape.values, vec![0.0, -1.0, 1.0, 5.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn arity_is_checked() {
        let mut tape = Tape::new();
        let x = tape.setup(&[1.0]).unwrap();
        let r = tape.cell(0.0).unwrap();
        assert_eq!(
            tape.arithmetic(Op::Add, r, &[x[0]]),
            Err(TapeError::Arity {
                operation: "addition",
                expected: 2,
                found: 1
            })
        );
        assert_eq!(
            tape.arithmetic(Op::Div, r, &[]),
            Err(TapeError::Arity {
                operation: "division",
                expected: 2,
                found: 0
            })
        );
        assert_eq!(
            tape.elemental(&elementals::POW, r, &[x[0]]),
            Err(TapeError::Arity {
                operation: "pow",
                expected: 2,
                found: 1
            })
        );
        assert_eq!(tape.recorded(), 0);
    }

    #[test]
    fn variables_come_first() {
        let mut tape = Tape::new();
        tape.enter(2).unwrap();
        let x = tape.cell(1.0).unwrap();
        let y = tape.cell(2.0).unwrap();
        tape.variable(x).unwrap();
        tape.arithmetic(Op::Neg, x, &[x]).unwrap();
        assert_eq!(tape.variable(y), Err(TapeError::LateVariable { location: y }));
    }

    #[test]
    fn no_more_variables_than_declared() {
        let mut tape = Tape::new();
        let x = tape.setup(&[1.0]).unwrap();
        assert_eq!(
            tape.variable(x[0]),
            Err(TapeError::Arity {
                operation: "variable",
                expected: 1,
                found: 2
            })
        );
    }

    #[test]
    fn stale_locations_are_rejected() {
        let mut tape = Tape::new();
        tape.enter(0).unwrap();
        let inner = tape.cell(1.0).unwrap();
        tape.abandon().unwrap();
        tape.enter(0).unwrap();
        let r = tape.constant(0.0).unwrap();
        let next = tape.cell(0.0).unwrap();
        assert_eq!(
            tape.arithmetic(Op::Neg, r, &[Location(5)]),
            Err(TapeError::InvalidLocation {
                location: Location(5)
            })
        );
        // the same index is reused by a new frame
        assert_eq!(inner, r);
        assert!(tape.value(next).is_ok());
    }

    #[test]
    fn names_alone_do_not_identify_elementals() {
        let mut tape = Tape::new();
        let x = tape.setup(&[2.0]).unwrap();
        let y = tape.cell(0.0).unwrap();
        let doubled_exp = Elemental::new("exp", 1, |x| 2.0 * x[0]);
        assert_eq!(
            tape.elemental(&doubled_exp, y, &[x[0]]),
            Err(TapeError::UnregisteredElemental { name: "exp" })
        );
        assert_eq!(tape.recorded(), 0);
        tape.elemental(&elementals::EXP, y, &[x[0]]).unwrap();
        tape.ret(y).unwrap();
        assert_eq!(tape.gradient(), Ok(vec![2.0_f64.exp()]));
    }

    #[test]
    fn recording_needs_a_frame() {
        let mut tape = Tape::new();
        let a = tape.constant(1.0).unwrap();
        assert_eq!(tape.assignment(a, a), Err(TapeError::FrameStackUnderflow));
        assert_eq!(tape.ret(a), Err(TapeError::FrameStackUnderflow));
    }
}
