/*!
 * Reverse mode automatic differentiation of scalar models, by recording every primitive
 * operation of a forward evaluation onto a [Tape](tape::Tape) and replaying it backwards.
 *
 * If this is your first time using Easy AD you should start with the [tape] module, then
 * look at [model] for how a differentiable model is written.
 *
 * # Overview
 * - [tape]: the recording, its frames, and the forward and backward passes
 * - [elementals]: primitive functions such as `exp` and `log` and the registry of their
 * derivatives
 * - [store]: per thread tapes for code that does not pass a tape around
 * - [model]: the `observe` then `gradient` contract consumed by optimisers and samplers
 */

pub mod config;
pub mod elementals;
pub mod errors;
pub mod model;
pub mod store;
pub mod tape;
