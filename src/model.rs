/*!
 * The contract between differentiable models and the code that optimises or samples them.
 *
 * A [Model] computes a scalar, usually a log likelihood, from a parameter vector by recording
 * onto a [Tape]. Straight after [observe](Model::observe) returns, [Tape::gradient] gives the
 * partial derivatives of that scalar with respect to each parameter, in the same order as the
 * parameters. [differentiate] does both steps.
 *
 * ```
 * use easy_ad::elementals;
 * use easy_ad::errors::TapeError;
 * use easy_ad::model::{self, Model};
 * use easy_ad::tape::{Op, Tape};
 *
 * // log likelihood of data under a normal distribution with unknown mean and unit
 * // variance, up to a constant
 * struct Mean {
 *     data: Vec<f64>,
 * }
 *
 * impl Model for Mean {
 *     fn observe(&self, tape: &mut Tape, parameters: &[f64]) -> Result<f64, TapeError> {
 *         let mean = tape.setup(parameters)?[0];
 *         let total = tape.constant(0.0)?;
 *         let half = tape.constant(-0.5)?;
 *         let term = tape.cell(0.0)?;
 *         for &x in &self.data {
 *             let x = tape.constant(x)?;
 *             tape.arithmetic(Op::Sub, term, &[x, mean])?;
 *             tape.arithmetic(Op::Mul, term, &[term, term])?;
 *             tape.arithmetic(Op::Mul, term, &[half, term])?;
 *             tape.arithmetic(Op::Add, total, &[total, term])?;
 *         }
 *         tape.ret(total)
 *     }
 * }
 *
 * let model = Mean { data: vec![1.0, 2.0, 3.0] };
 * let mut tape = Tape::new();
 * let result = model::differentiate(&model, &mut tape, &[1.0]).unwrap();
 * // d/dmean = sum(x - mean)
 * assert_eq!(result.gradient, vec![3.0]);
 * ```
 */

use crate::errors::TapeError;
use crate::tape::Tape;

/**
 * A differentiable scalar function of a parameter vector.
 *
 * Implementations must open exactly one frame for the parameters, with
 * [setup](Tape::setup) or [enter](Tape::enter) and [variable](Tape::variable), and finish
 * by marking the scalar with [ret](Tape::ret), leaving the frame open for the caller's
 * [gradient](Tape::gradient).
 *
 * Sub-models called from `observe` open nested frames of their own. Ending them with
 * [leave](Tape::leave) keeps their records, so the gradient flows through them into the
 * caller's parameters.
 */
pub trait Model {
    fn observe(&self, tape: &mut Tape, parameters: &[f64]) -> Result<f64, TapeError>;
}

/**
 * Closures taking a tape and parameters are models.
 */
impl<F> Model for F
where
    F: Fn(&mut Tape, &[f64]) -> Result<f64, TapeError>,
{
    fn observe(&self, tape: &mut Tape, parameters: &[f64]) -> Result<f64, TapeError> {
        self(tape, parameters)
    }
}

/**
 * The value of a model at some parameters and its gradient there.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ModelGradient {
    pub value: f64,
    pub gradient: Vec<f64>,
}

/**
 * Observes a model at `parameters` and computes the gradient.
 *
 * If the model fails part way through, any frames it left open are abandoned before the
 * error is returned, so the tape is left as it was found.
 */
pub fn differentiate<M>(
    model: &M,
    tape: &mut Tape,
    parameters: &[f64],
) -> Result<ModelGradient, TapeError>
where
    M: Model + ?Sized,
{
    let depth = tape.depth();
    let value = match model.observe(tape, parameters) {
        Ok(value) => value,
        Err(error) => {
            while tape.depth() > depth {
                tape.abandon()?;
            }
            return Err(error);
        }
    };
    let gradient = tape.gradient()?;
    Ok(ModelGradient { value, gradient })
}
