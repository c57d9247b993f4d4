/*!
 * Elemental functions and the registry of their derivatives.
 *
 * An elemental is a primitive scalar function such as `exp` or `sin` that the tape treats as
 * opaque. The tape cannot look inside it, so its partial derivatives have to be supplied by
 * a [Derivative] rule registered against the elemental. Calling an elemental that has
 * no registered rule on a [Tape](crate::tape::Tape) fails immediately with
 * [UnregisteredElemental](crate::errors::TapeError::UnregisteredElemental) rather than
 * quietly treating it as a constant.
 *
 * The registry is process wide and append only. The elementals in this module are
 * registered the first time the registry is touched, further ones can be added with
 * [register_elemental].
 *
 * ```
 * use easy_ad::elementals::{self, Elemental};
 * use easy_ad::tape::Tape;
 *
 * #[inline(never)]
 * fn cube(x: &[f64]) -> f64 {
 *     x[0] * x[0] * x[0]
 * }
 * // d(x^3)/dx = 3x^2
 * fn cube_derivative(_value: f64, x: &[f64], partials: &mut [f64]) {
 *     partials[0] = 3.0 * x[0] * x[0];
 * }
 * const CUBE: Elemental = Elemental::new("doc::cube", 1, cube);
 * elementals::register_elemental(&CUBE, cube_derivative).unwrap();
 *
 * let mut tape = Tape::new();
 * let x = tape.setup(&[2.0]).unwrap();
 * let y = tape.cell(0.0).unwrap();
 * let y = tape.elemental(&CUBE, y, &[x[0]]).unwrap();
 * tape.ret(y).unwrap();
 * assert_eq!(tape.gradient().unwrap(), vec![12.0]);
 * ```
 */

use crate::errors::TapeError;

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock};

/**
 * The forward computation of an elemental, given its argument values.
 */
pub type Function = fn(arguments: &[f64]) -> f64;

/**
 * The derivative rule of an elemental.
 *
 * Given the value the elemental returned and the values of its arguments at the time of the
 * call, writes ∂value/∂argument\[i\] into `partials[i]` for each argument. `partials` is the
 * same length as `arguments` and starts zeroed.
 */
pub type Derivative = fn(value: f64, arguments: &[f64], partials: &mut [f64]);

/**
 * A primitive scalar function of a fixed number of arguments.
 *
 * Elementals are identified by their name, arity and function pointer together. An
 * elemental that reuses a registered name with a different function or arity does not get
 * that name's derivative rule. Function pointers are compared by address, so the function
 * should be a plain `fn` item marked `#[inline(never)]`, which keeps its address the same in
 * every crate that names it.
 */
#[derive(Clone, Copy)]
pub struct Elemental {
    name: &'static str,
    arity: usize,
    function: Function,
}

impl Elemental {
    pub const fn new(name: &'static str, arity: usize, function: Function) -> Self {
        Elemental {
            name,
            arity,
            function,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /**
     * Evaluates the elemental without recording anything.
     */
    #[inline]
    pub fn call(&self, arguments: &[f64]) -> f64 {
        (self.function)(arguments)
    }
}

impl fmt::Debug for Elemental {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Elemental")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

impl PartialEq for Elemental {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.arity == other.arity
            && std::ptr::fn_addr_eq(self.function, other.function)
    }
}

impl Eq for Elemental {}

impl Hash for Elemental {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/**
 * A registered elemental and its derivative rule.
 */
#[derive(Clone, Copy)]
struct Rule {
    elemental: Elemental,
    derivative: Derivative,
}

static REGISTRY: Lazy<RwLock<HashMap<&'static str, Rule>>> = Lazy::new(|| {
    let mut rules = HashMap::new();
    for &(elemental, derivative) in BUILTINS {
        rules.insert(
            elemental.name,
            Rule {
                elemental,
                derivative,
            },
        );
    }
    RwLock::new(rules)
});

/**
 * Registers the derivative rule for an elemental.
 *
 * Fails with [DuplicateElemental](TapeError::DuplicateElemental) if the name is already
 * taken, the registry never replaces a rule once added.
 */
pub fn register_elemental(elemental: &Elemental, derivative: Derivative) -> Result<(), TapeError> {
    // poisoning can only happen mid insert, which leaves the map itself intact
    let mut rules = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    if rules.contains_key(elemental.name) {
        return Err(TapeError::DuplicateElemental {
            name: elemental.name,
        });
    }
    rules.insert(
        elemental.name,
        Rule {
            elemental: *elemental,
            derivative,
        },
    );
    tracing::debug!(name = elemental.name, arity = elemental.arity, "registered elemental");
    Ok(())
}

/**
 * Finds the derivative rule registered for an elemental, if any.
 *
 * A rule is only returned for the elemental it was registered with. An elemental that shares
 * a registered name but has a different function or arity has no rule.
 */
pub fn lookup(elemental: &Elemental) -> Option<Derivative> {
    let rules = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    let rule = rules.get(elemental.name)?;
    if rule.elemental == *elemental {
        Some(rule.derivative)
    } else {
        tracing::debug!(
            name = elemental.name,
            arity = elemental.arity,
            "elemental shares a registered name but not its function"
        );
        None
    }
}

pub fn is_registered(elemental: &Elemental) -> bool {
    lookup(elemental).is_some()
}

#[inline(never)]
fn sqrt(x: &[f64]) -> f64 {
    x[0].sqrt()
}

/// `d(sqrt(x)) / dx = 1 / (2 sqrt(x))`
fn d_sqrt(value: f64, _x: &[f64], partials: &mut [f64]) {
    partials[0] = 0.5 / value;
}

#[inline(never)]
fn exp(x: &[f64]) -> f64 {
    x[0].exp()
}

/// `d(e^x) / dx = e^x`
fn d_exp(value: f64, _x: &[f64], partials: &mut [f64]) {
    partials[0] = value;
}

#[inline(never)]
fn log(x: &[f64]) -> f64 {
    x[0].ln()
}

/// `d(ln(x)) / dx = 1 / x`
fn d_log(_value: f64, x: &[f64], partials: &mut [f64]) {
    partials[0] = 1.0 / x[0];
}

#[inline(never)]
fn log1p(x: &[f64]) -> f64 {
    x[0].ln_1p()
}

fn d_log1p(_value: f64, x: &[f64], partials: &mut [f64]) {
    partials[0] = 1.0 / (1.0 + x[0]);
}

#[inline(never)]
fn expm1(x: &[f64]) -> f64 {
    x[0].exp_m1()
}

fn d_expm1(value: f64, _x: &[f64], partials: &mut [f64]) {
    partials[0] = value + 1.0;
}

#[inline(never)]
fn sin(x: &[f64]) -> f64 {
    x[0].sin()
}

fn d_sin(_value: f64, x: &[f64], partials: &mut [f64]) {
    partials[0] = x[0].cos();
}

#[inline(never)]
fn cos(x: &[f64]) -> f64 {
    x[0].cos()
}

fn d_cos(_value: f64, x: &[f64], partials: &mut [f64]) {
    partials[0] = -x[0].sin();
}

#[inline(never)]
fn tan(x: &[f64]) -> f64 {
    x[0].tan()
}

/// `d(tan(x)) / dx = 1 + tan^2(x)`
fn d_tan(value: f64, _x: &[f64], partials: &mut [f64]) {
    partials[0] = 1.0 + value * value;
}

#[inline(never)]
fn tanh(x: &[f64]) -> f64 {
    x[0].tanh()
}

fn d_tanh(value: f64, _x: &[f64], partials: &mut [f64]) {
    partials[0] = 1.0 - value * value;
}

#[inline(never)]
fn atan(x: &[f64]) -> f64 {
    x[0].atan()
}

fn d_atan(_value: f64, x: &[f64], partials: &mut [f64]) {
    partials[0] = 1.0 / (1.0 + x[0] * x[0]);
}

#[inline(never)]
fn logistic(x: &[f64]) -> f64 {
    1.0 / (1.0 + (-x[0]).exp())
}

/// `d(σ(x)) / dx = σ(x)(1 - σ(x))`
fn d_logistic(value: f64, _x: &[f64], partials: &mut [f64]) {
    partials[0] = value * (1.0 - value);
}

#[inline(never)]
fn abs(x: &[f64]) -> f64 {
    x[0].abs()
}

// subgradient of 0 at 0
fn d_abs(_value: f64, x: &[f64], partials: &mut [f64]) {
    partials[0] = if x[0] > 0.0 {
        1.0
    } else if x[0] < 0.0 {
        -1.0
    } else {
        0.0
    };
}

#[inline(never)]
fn pow(x: &[f64]) -> f64 {
    x[0].powf(x[1])
}

/// `d(x^y) / dx = y * x^(y-1)`, `d(x^y) / dy = x^y * ln(x)`
fn d_pow(value: f64, x: &[f64], partials: &mut [f64]) {
    partials[0] = x[1] * x[0].powf(x[1] - 1.0);
    partials[1] = if value == 0.0 { 0.0 } else { value * x[0].ln() };
}

#[inline(never)]
fn logsumexp(x: &[f64]) -> f64 {
    let max = x[0].max(x[1]);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + ((x[0] - max).exp() + (x[1] - max).exp()).ln()
}

/// `d(ln(e^x + e^y)) / dx = e^(x - value)`
fn d_logsumexp(value: f64, x: &[f64], partials: &mut [f64]) {
    if value == f64::NEG_INFINITY {
        return;
    }
    partials[0] = (x[0] - value).exp();
    partials[1] = (x[1] - value).exp();
}

#[inline(never)]
fn hypot(x: &[f64]) -> f64 {
    x[0].hypot(x[1])
}

fn d_hypot(value: f64, x: &[f64], partials: &mut [f64]) {
    if value == 0.0 {
        return;
    }
    partials[0] = x[0] / value;
    partials[1] = x[1] / value;
}

pub const SQRT: Elemental = Elemental::new("sqrt", 1, sqrt);
pub const EXP: Elemental = Elemental::new("exp", 1, exp);
pub const LOG: Elemental = Elemental::new("log", 1, log);
pub const LOG1P: Elemental = Elemental::new("log1p", 1, log1p);
pub const EXPM1: Elemental = Elemental::new("expm1", 1, expm1);
pub const SIN: Elemental = Elemental::new("sin", 1, sin);
pub const COS: Elemental = Elemental::new("cos", 1, cos);
pub const TAN: Elemental = Elemental::new("tan", 1, tan);
pub const TANH: Elemental = Elemental::new("tanh", 1, tanh);
pub const ATAN: Elemental = Elemental::new("atan", 1, atan);
pub const LOGISTIC: Elemental = Elemental::new("logistic", 1, logistic);
pub const ABS: Elemental = Elemental::new("abs", 1, abs);
pub const POW: Elemental = Elemental::new("pow", 2, pow);
pub const LOGSUMEXP: Elemental = Elemental::new("logsumexp", 2, logsumexp);
pub const HYPOT: Elemental = Elemental::new("hypot", 2, hypot);

const BUILTINS: &[(Elemental, Derivative)] = &[
    (SQRT, d_sqrt),
    (EXP, d_exp),
    (LOG, d_log),
    (LOG1P, d_log1p),
    (EXPM1, d_expm1),
    (SIN, d_sin),
    (COS, d_cos),
    (TAN, d_tan),
    (TANH, d_tanh),
    (ATAN, d_atan),
    (LOGISTIC, d_logistic),
    (ABS, d_abs),
    (POW, d_pow),
    (LOGSUMEXP, d_logsumexp),
    (HYPOT, d_hypot),
];
