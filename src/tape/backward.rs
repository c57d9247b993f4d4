/*!
 * The backward pass.
 */

use crate::errors::TapeError;
use crate::tape::{Frame, Kind, Location, Record, Tape};

impl Tape {
    /**
     * Computes the gradient of the current frame's result with respect to each of its
     * parameters, in the order they were registered, then pops the frame.
     *
     * The records of the frame are replayed in reverse, accumulating the adjoint of every
     * location that contributed to the result. Cells written in the frame are put back to the
     * values they had before each write while replaying, and given back their final forward
     * values afterwards.
     *
     * The popped frame is opaque to any enclosing frame, which sees its result only as a
     * value. A nested frame that wrote to a cell of an enclosing frame therefore fails with
     * [EscapingWrite](TapeError::EscapingWrite), end such calls with [leave](Tape::leave)
     * instead. Only the outermost frame may write to cells allocated before it was entered.
     *
     * Fails with [FrameStackUnderflow](TapeError::FrameStackUnderflow) if no frame is open,
     * [DoublePop](TapeError::DoublePop) if called again for a frame that was already
     * differentiated, and [MissingResult](TapeError::MissingResult) if the frame never
     * called [ret](Tape::ret). Every error but the first two pops the frame anyway.
     */
    pub fn gradient(&mut self) -> Result<Vec<f64>, TapeError> {
        self.check_owner()?;
        let frame = match self.frames.last() {
            Some(frame) => *frame,
            None if self.popped => return Err(TapeError::DoublePop),
            None => return Err(TapeError::FrameStackUnderflow),
        };
        // a nested frame was just differentiated and this one has recorded nothing since
        if frame.child_popped && frame.result.is_none() {
            return Err(TapeError::DoublePop);
        }
        let result = match frame.result {
            Some(result) => result,
            None => {
                self.close(frame);
                return Err(TapeError::MissingResult);
            }
        };
        if frame.declared != frame.parameters {
            self.close(frame);
            return Err(TapeError::Arity {
                operation: "gradient",
                expected: frame.parameters,
                found: frame.declared,
            });
        }

        // final values of cells that outlive the frame
        let survivors: Vec<(Location, f64)> = self.records[frame.records..]
            .iter()
            .map(|record| self.places[record.places])
            .filter(|location| location.index() < frame.cells)
            .map(|location| (location, self.cells[location.index()]))
            .collect();
        if self.frames.len() > 1 {
            if let Some(&(location, _)) = survivors.first() {
                self.close(frame);
                return Err(TapeError::EscapingWrite { location });
            }
        }

        self.bars.insert(result, 1.0);
        self.replaying = true;
        for index in (frame.records..self.records.len()).rev() {
            let record = self.records[index];
            self.undo(record);
        }
        self.replaying = false;

        let start = frame.places;
        let gradient = self.places[start..start + frame.parameters]
            .iter()
            .map(|location| self.bars.get(location).copied().unwrap_or(0.0))
            .collect();

        for (location, value) in survivors {
            self.cells[location.index()] = value;
        }
        tracing::trace!(
            records = self.records.len() - frame.records,
            parameters = frame.parameters,
            "computed gradient"
        );
        self.close(frame);
        Ok(gradient)
    }

    /**
     * Pops a frame ended by a gradient, remembering the pop so that a second gradient for
     * the same frame is reported.
     */
    fn close(&mut self, frame: Frame) {
        self.pop(frame);
        match self.frames.last_mut() {
            Some(parent) => parent.child_popped = true,
            None => self.popped = true,
        }
    }

    /**
     * Propagates the adjoint of one record's result to its operands and restores the
     * result cell to its value before the record.
     */
    fn undo(&mut self, record: Record) {
        let result = self.places[record.places];
        let before = self.values[record.values];
        match record.kind {
            Kind::Assignment => {
                let src = self.places[record.places + 1];
                // v = v leaves the adjoint where it is
                if src != result {
                    let bar = self.bars.remove(&result).unwrap_or(0.0);
                    self.accumulate(src, bar);
                }
                self.cells[result.index()] = before;
            }
            Kind::Arithmetic(op) => {
                let bar = self.bars.remove(&result).unwrap_or(0.0);
                self.cells[result.index()] = before;
                let operands = record.places + 1..record.places + 1 + op.arity();
                let u = self.cells[self.places[operands.start].index()];
                let w = if op.arity() == 2 {
                    self.cells[self.places[operands.start + 1].index()]
                } else {
                    0.0
                };
                let partials = op.partials(u, w);
                // an operand used twice, as in u * u, accumulates once per use
                for (place, partial) in operands.zip(partials) {
                    let operand = self.places[place];
                    self.accumulate(operand, bar * partial);
                }
            }
            Kind::Elemental(call) => {
                let bar = self.bars.remove(&result).unwrap_or(0.0);
                self.cells[result.index()] = before;
                let call = self.calls[call];
                let value = self.values[record.values + 1];
                let arguments = &self.values[record.values + 2..record.values + 2 + call.arity];
                let mut partials = vec![0.0; call.arity];
                (call.derivative)(value, arguments, &mut partials);
                for (i, partial) in partials.into_iter().enumerate() {
                    let operand = self.places[record.places + 1 + i];
                    self.accumulate(operand, bar * partial);
                }
            }
        }
    }

    #[inline]
    fn accumulate(&mut self, location: Location, adjoint: f64) {
        *self.bars.entry(location).or_insert(0.0) += adjoint;
    }
}
