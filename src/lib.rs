//! A limited-memory quasi-Newton (L-BFGS) maximizer with a safeguarded
//! backtracking line search.
//!
//! This crate provides an ascent-form solver for smooth unconstrained
//! maximization problems, built on the limited-memory BFGS method described
//! in "Numerical Optimization" by Nocedal & Wright. It was written to drive
//! maximum-likelihood training (a Poisson log-likelihood with L2
//! regularization, for instance) but is agnostic to the objective: anything
//! that can report a parameter vector, a scalar value, and a gradient will
//! do.
//!
//! # Features
//! - Two-loop recursion over a bounded history (default depth 7) of
//!   parameter and gradient differences; the oldest correction is evicted
//!   once the history is full.
//! - Safeguarded line search enforcing a sufficient-increase (Wolfe-type)
//!   condition, with quadratic interpolation on the first backtrack and
//!   cubic interpolation afterwards. Infinite objective values shrink the
//!   step instead of aborting the search.
//! - Soft termination statuses ([`RunStatus`]) for stagnation and exhausted
//!   iteration budgets; hard errors ([`LbfgsError`]) are reserved for
//!   objectives whose gradient is inconsistent with their value function.
//! - Configurable tolerances and step caps through a builder API, and an
//!   optional per-iteration progress observer.
//!
//! # Example
//!
//! Maximize a concave quadratic, the ascent analogue of the quadratic bowl.
//!
//! ```
//! use lbfgs_ascent::{FnObjective, Lbfgs};
//! use ndarray::{array, Array1};
//!
//! let objective = FnObjective::new(
//!     array![4.0, -3.0],
//!     |theta: &Array1<f64>| -((theta[0] - 1.0).powi(2) + 2.0 * (theta[1] - 2.0).powi(2)),
//!     |theta: &Array1<f64>| array![-2.0 * (theta[0] - 1.0), -4.0 * (theta[1] - 2.0)],
//! );
//!
//! let solution = Lbfgs::new(objective)
//!     .with_gradient_tolerance(1e-5)
//!     .with_absolute_tolerance(1e-10)
//!     .run()
//!     .expect("objective is consistent");
//!
//! assert!(solution.status.is_converged());
//! assert!((solution.final_parameters[0] - 1.0).abs() < 1e-3);
//! assert!((solution.final_parameters[1] - 2.0).abs() < 1e-3);
//! ```

use ndarray::Array1;
use std::collections::VecDeque;

// Smoothing term in the relative objective-value convergence test, so the
// test stays meaningful when both values are near zero.
const VALUE_EPSILON: f64 = 1e-5;

#[inline]
fn norm2(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

/// The differentiable function being maximized.
///
/// The solver owns no numeric state of its own between runs; the objective
/// holds the canonical parameter vector and the solver reads and writes it
/// only through this interface. `value` and `gradient` are always evaluated
/// at the currently-set parameters.
///
/// `value` may legitimately return `+inf`, `-inf`, or `NaN` under
/// numerically unstable parameters; the line search reacts to infinities by
/// shrinking the step.
pub trait Objective {
    /// Returns a snapshot of the current parameter vector.
    fn parameters(&self) -> Array1<f64>;
    /// Replaces the current parameter vector.
    fn set_parameters(&mut self, parameters: Array1<f64>);
    /// Evaluates the objective at the current parameters.
    fn value(&self) -> f64;
    /// Evaluates the gradient at the current parameters.
    fn gradient(&self) -> Array1<f64>;
}

/// Adapter exposing a parameter vector plus a pair of closures as an
/// [`Objective`].
///
/// ```
/// use lbfgs_ascent::{FnObjective, Objective};
/// use ndarray::{array, Array1};
///
/// let objective = FnObjective::new(
///     array![0.5],
///     |theta: &Array1<f64>| -(theta[0] * theta[0]),
///     |theta: &Array1<f64>| array![-2.0 * theta[0]],
/// );
/// assert_eq!(objective.value(), -0.25);
/// ```
pub struct FnObjective<V, G> {
    parameters: Array1<f64>,
    value_fn: V,
    gradient_fn: G,
}

impl<V, G> FnObjective<V, G>
where
    V: Fn(&Array1<f64>) -> f64,
    G: Fn(&Array1<f64>) -> Array1<f64>,
{
    /// Wraps an initial parameter vector, a value closure, and a gradient
    /// closure.
    pub fn new(parameters: Array1<f64>, value_fn: V, gradient_fn: G) -> Self {
        Self {
            parameters,
            value_fn,
            gradient_fn,
        }
    }
}

impl<V, G> Objective for FnObjective<V, G>
where
    V: Fn(&Array1<f64>) -> f64,
    G: Fn(&Array1<f64>) -> Array1<f64>,
{
    fn parameters(&self) -> Array1<f64> {
        self.parameters.clone()
    }

    fn set_parameters(&mut self, parameters: Array1<f64>) {
        self.parameters = parameters;
    }

    fn value(&self) -> f64 {
        (self.value_fn)(&self.parameters)
    }

    fn gradient(&self) -> Array1<f64> {
        (self.gradient_fn)(&self.parameters)
    }
}

/// An error type for objectives that broke their contract.
///
/// Ordinary non-convergence is not an error and is reported through
/// [`RunStatus`]. These variants fire when the value and gradient queries of
/// an objective are inconsistent with each other (or with the parameter
/// vector), and they abort the run rather than let corrupted curvature
/// information steer further steps.
#[derive(Debug, thiserror::Error)]
pub enum LbfgsError {
    /// The curvature term `sᵀy` was positive, which cannot happen for a
    /// gradient that matches the value function under the ascent convention.
    #[error("curvature term sᵀy = {sy:.6e} > 0; the gradient is inconsistent with the objective value")]
    CurvatureViolation { sy: f64 },
    /// The initial Hessian scaling `γ = sᵀy / yᵀy` was positive.
    #[error("Hessian scaling γ = {gamma:.6e} > 0; the gradient is inconsistent with the objective value")]
    ScalingViolation { gamma: f64 },
    /// A step satisfied the sufficient-increase condition yet left the
    /// objective below its pre-search value.
    #[error("objective value {value:.6e} fell below its pre-step baseline {baseline:.6e} despite an accepted step")]
    ValueDecreased { value: f64, baseline: f64 },
    /// The objective reported a gradient whose length differs from its
    /// parameter vector.
    #[error("objective reported {parameters} parameters but a gradient of length {gradient}")]
    DimensionMismatch { parameters: usize, gradient: usize },
}

/// Terminal state of one optimization run.
///
/// `Stalled` and `ExhaustedBudget` are soft outcomes, not errors: the best
/// parameters found so far are retained on the objective and the caller
/// decides whether partial convergence is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// A convergence tolerance was met.
    Converged,
    /// The gradient vanished, or the line search could not find an improving
    /// step along the current direction.
    Stalled,
    /// The iteration budget ran out before any tolerance was met.
    ExhaustedBudget,
}

impl RunStatus {
    /// Returns `true` when the run met a convergence tolerance.
    pub fn is_converged(&self) -> bool {
        matches!(self, RunStatus::Converged)
    }
}

/// A summary of one optimization run.
#[derive(Debug)]
pub struct LbfgsSolution {
    /// How the run ended.
    pub status: RunStatus,
    /// The parameter vector the objective was left with.
    pub final_parameters: Array1<f64>,
    /// The objective value at the final parameters.
    pub final_value: f64,
    /// The gradient norm at the final parameters.
    pub final_gradient_norm: f64,
    /// The total number of completed outer iterations.
    pub iterations: usize,
}

/// Convergence configuration for the solver.
struct LbfgsCore {
    max_iterations: usize,
    max_search_iterations: usize,
    relative_tolerance: f64,
    absolute_tolerance: f64,
    gradient_tolerance: f64,
    value_tolerance: f64,
    max_step: f64,
    history_depth: usize,
    sufficient_increase: f64,
}

impl Default for LbfgsCore {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_search_iterations: 100,
            relative_tolerance: 1e-7,
            absolute_tolerance: 1e-4,
            gradient_tolerance: 1e-3,
            value_tolerance: 1e-4,
            max_step: 100.0,
            history_depth: 7,
            sufficient_increase: 1e-4, // ALF, standard sufficient-increase constant
        }
    }
}

/// Bounded correction history: three parallel queues of parameter deltas,
/// gradient deltas, and curvature scalings, capped at the configured depth.
/// Pushing onto a full history evicts the oldest triple.
struct History {
    s: VecDeque<Array1<f64>>,
    y: VecDeque<Array1<f64>>,
    rho: VecDeque<f64>,
    capacity: usize,
}

impl History {
    fn new(capacity: usize) -> Self {
        Self {
            s: VecDeque::with_capacity(capacity),
            y: VecDeque::with_capacity(capacity),
            rho: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, s: Array1<f64>, y: Array1<f64>, rho: f64) {
        if self.s.len() == self.capacity {
            self.s.pop_front();
            self.y.pop_front();
            self.rho.pop_front();
        }
        self.s.push_back(s);
        self.y.push_back(y);
        self.rho.push_back(rho);
    }

    fn len(&self) -> usize {
        self.s.len()
    }
}

/// Per-run solver state; absent until the first line search succeeds.
struct IterationState {
    parameters: Array1<f64>,
    gradient: Array1<f64>,
    old_parameters: Array1<f64>,
    old_gradient: Array1<f64>,
    history: History,
    alpha: Vec<f64>,
    iterations: usize,
}

/// A configurable limited-memory quasi-Newton maximizer.
///
/// Construct with [`Lbfgs::new`], adjust tolerances with the `with_*`
/// builder methods, then call [`Lbfgs::run`] (or [`Lbfgs::optimize`] for
/// explicit per-call iteration budgets).
pub struct Lbfgs<O> {
    core: LbfgsCore,
    objective: O,
    observer: Option<Box<dyn FnMut(usize, usize)>>,
    state: Option<IterationState>,
}

impl<O: Objective> Lbfgs<O> {
    /// Creates a new solver around the given objective.
    pub fn new(objective: O) -> Self {
        Self {
            core: LbfgsCore::default(),
            objective,
            observer: None,
            state: None,
        }
    }

    /// Sets the total outer-iteration budget (default: 100).
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.core.max_iterations = max_iterations;
        self
    }

    /// Sets the per-direction line-search trial budget (default: 100).
    pub fn with_max_search_iterations(mut self, max_search_iterations: usize) -> Self {
        self.core.max_search_iterations = max_search_iterations;
        self
    }

    /// Sets the relative parameter-change tolerance below which a line-search
    /// step counts as stagnation (default: 1e-7).
    pub fn with_relative_tolerance(mut self, relative_tolerance: f64) -> Self {
        self.core.relative_tolerance = relative_tolerance;
        self
    }

    /// Sets the absolute parameter-change tolerance below which a line-search
    /// step counts as stagnation (default: 1e-4).
    pub fn with_absolute_tolerance(mut self, absolute_tolerance: f64) -> Self {
        self.core.absolute_tolerance = absolute_tolerance;
        self
    }

    /// Sets the gradient-norm convergence tolerance (default: 1e-3).
    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.core.gradient_tolerance = gradient_tolerance;
        self
    }

    /// Sets the relative objective-value-change convergence tolerance
    /// (default: 1e-4).
    pub fn with_value_tolerance(mut self, value_tolerance: f64) -> Self {
        self.core.value_tolerance = value_tolerance;
        self
    }

    /// Sets the cap on the norm of any search direction (default: 100).
    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.core.max_step = max_step;
        self
    }

    /// Sets the correction-history depth `m` (default: 7). Values between 3
    /// and 7 are typical; a minimum of 1 is enforced.
    pub fn with_history_depth(mut self, history_depth: usize) -> Self {
        self.core.history_depth = history_depth.max(1);
        self
    }

    /// Sets the sufficient-increase constant used by the Wolfe-type
    /// acceptance test (default: 1e-4).
    pub fn with_sufficient_increase(mut self, sufficient_increase: f64) -> Self {
        self.core.sufficient_increase = sufficient_increase;
        self
    }

    /// Installs a progress observer, invoked synchronously once per outer
    /// iteration with the iteration index and the per-call budget.
    pub fn with_observer(mut self, observer: impl FnMut(usize, usize) + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Borrows the objective.
    pub fn objective(&self) -> &O {
        &self.objective
    }

    /// Mutably borrows the objective.
    pub fn objective_mut(&mut self) -> &mut O {
        &mut self.objective
    }

    /// Consumes the solver and returns the objective, parameters included.
    pub fn into_objective(self) -> O {
        self.objective
    }

    /// Runs up to the configured iteration budget and returns a summary of
    /// the final state.
    ///
    /// # Errors
    /// Propagates any [`LbfgsError`] raised by [`Lbfgs::optimize`].
    pub fn run(&mut self) -> Result<LbfgsSolution, LbfgsError> {
        let status = self.optimize(self.core.max_iterations)?;
        let gradient = self.objective.gradient();
        Ok(LbfgsSolution {
            status,
            final_parameters: self.objective.parameters(),
            final_value: self.objective.value(),
            final_gradient_norm: norm2(&gradient),
            iterations: self.state.as_ref().map_or(0, |s| s.iterations),
        })
    }

    /// Drives up to `num_iterations` outer iterations toward a stationary
    /// point of the objective.
    ///
    /// The first call takes an initial step along the normalized gradient;
    /// subsequent calls resume from the retained quasi-Newton state, so the
    /// budget may be spread over several calls. Soft outcomes (stagnation,
    /// exhausted budget) are returned as a [`RunStatus`]; the objective is
    /// always left at the best parameters found.
    ///
    /// # Errors
    /// Returns an [`LbfgsError`] when the objective's gradient is
    /// inconsistent with its value function. The run must be abandoned in
    /// that case; the curvature history is no longer trustworthy.
    pub fn optimize(&mut self, num_iterations: usize) -> Result<RunStatus, LbfgsError> {
        if self.state.is_none() && !self.initialize()? {
            return Ok(RunStatus::Stalled);
        }

        let Lbfgs {
            core,
            objective,
            observer,
            state,
        } = self;
        let Some(state) = state.as_mut() else {
            return Ok(RunStatus::Stalled);
        };

        for iteration in 0..num_iterations {
            // Re-entry after convergence lands here with a vanishing
            // gradient; answer without touching the history.
            let gradient_norm = norm2(&state.gradient);
            if gradient_norm < core.gradient_tolerance || gradient_norm == 0.0 {
                log::info!(
                    "[L-BFGS] converged by gradient: iters={}, ||g||={:.3e}",
                    state.iterations,
                    gradient_norm
                );
                return Ok(RunStatus::Converged);
            }

            if let Some(observer) = observer.as_mut() {
                observer(iteration, num_iterations);
            }

            let value = objective.value();

            // Deltas since the previous iterate. A pair of like-signed
            // infinities is collapsed to zero so NaN never enters the
            // history.
            let s = delta(&state.parameters, &state.old_parameters);
            let y = delta(&state.gradient, &state.old_gradient);

            let sy = s.dot(&y);
            if sy > 0.0 {
                log::warn!("[L-BFGS] curvature violation: sᵀy = {sy:.6e} > 0");
                return Err(LbfgsError::CurvatureViolation { sy });
            }
            let gamma = sy / y.dot(&y);
            if gamma > 0.0 {
                log::warn!("[L-BFGS] scaling violation: γ = {gamma:.6e} > 0");
                return Err(LbfgsError::ScalingViolation { gamma });
            }

            state.history.push(s, y, 1.0 / sy);

            // Two-loop recursion over the correction history, then flip the
            // result to the ascent convention expected by the line search.
            let IterationState {
                history,
                alpha,
                gradient,
                ..
            } = &mut *state;
            let mut direction = gradient.clone();
            for i in (0..history.len()).rev() {
                alpha[i] = history.rho[i] * history.s[i].dot(&direction);
                direction.scaled_add(-alpha[i], &history.y[i]);
            }
            direction *= gamma;
            for i in 0..history.len() {
                let beta = history.rho[i] * history.y[i].dot(&direction);
                direction.scaled_add(alpha[i] - beta, &history.s[i]);
            }
            direction *= -1.0;

            state.old_parameters = state.parameters.clone();
            state.old_gradient = state.gradient.clone();

            if !line_search(core, objective, &mut direction)? {
                log::info!(
                    "[L-BFGS] line search found no improving step at iteration {iteration}; stopping"
                );
                return Ok(RunStatus::Stalled);
            }

            state.parameters = objective.parameters();
            state.gradient = objective.gradient();

            let new_value = objective.value();
            if 2.0 * (new_value - value).abs()
                <= core.value_tolerance * (new_value.abs() + value.abs() + VALUE_EPSILON)
            {
                log::info!(
                    "[L-BFGS] converged by value: iters={}, f={:.6e}",
                    state.iterations,
                    new_value
                );
                return Ok(RunStatus::Converged);
            }

            let gradient_norm = norm2(&state.gradient);
            if gradient_norm < core.gradient_tolerance || gradient_norm == 0.0 {
                log::info!(
                    "[L-BFGS] converged by gradient: iters={}, ||g||={:.3e}",
                    state.iterations,
                    gradient_norm
                );
                return Ok(RunStatus::Converged);
            }

            state.iterations += 1;
            if state.iterations > core.max_iterations {
                log::info!(
                    "[L-BFGS] iteration budget exhausted: iters={}, ||g||={:.3e}",
                    state.iterations,
                    gradient_norm
                );
                return Ok(RunStatus::ExhaustedBudget);
            }
        }

        Ok(RunStatus::ExhaustedBudget)
    }

    /// Takes the first step: a line search along the normalized gradient.
    /// Returns `false` when the objective is already stationary or no
    /// improving step exists.
    fn initialize(&mut self) -> Result<bool, LbfgsError> {
        let parameters = self.objective.parameters();
        let gradient = self.objective.gradient();
        if gradient.len() != parameters.len() {
            return Err(LbfgsError::DimensionMismatch {
                parameters: parameters.len(),
                gradient: gradient.len(),
            });
        }

        let magnitude: f64 = gradient.iter().map(|g| g.abs()).sum();
        if magnitude == 0.0 {
            log::info!("[L-BFGS] gradient is identically zero; already at a stationary point");
            return Ok(false);
        }

        let mut direction = &gradient / norm2(&gradient);
        if !line_search(&self.core, &mut self.objective, &mut direction)? {
            log::info!("[L-BFGS] no improving step along the initial gradient direction");
            return Ok(false);
        }

        self.state = Some(IterationState {
            parameters: self.objective.parameters(),
            gradient: self.objective.gradient(),
            old_parameters: parameters,
            old_gradient: gradient,
            history: History::new(self.core.history_depth),
            alpha: vec![0.0; self.core.history_depth],
            iterations: 0,
        });
        Ok(true)
    }
}

/// Componentwise difference `current - previous`, collapsing a pair of
/// like-signed infinities to zero.
fn delta(current: &Array1<f64>, previous: &Array1<f64>) -> Array1<f64> {
    current
        .iter()
        .zip(previous.iter())
        .map(|(&c, &p)| {
            if c.is_infinite() && p.is_infinite() && c * p > 0.0 {
                0.0
            } else {
                c - p
            }
        })
        .collect()
}

/// Searches along `direction` for a step length that sufficiently increases
/// the objective.
///
/// The direction is rescaled in place to the configured step cap before the
/// first trial. On success the objective is left at the accepted point and
/// `Ok(true)` is returned; on stagnation or trial exhaustion the pre-search
/// parameters are restored and `Ok(false)` is returned.
///
/// Backtracking follows the classic safeguarded scheme: the first shrink
/// uses a one-dimensional quadratic model, subsequent shrinks a cubic model
/// through the two most recent trials, with the new step clamped to
/// `[0.1λ, 0.5λ]`. An infinite trial value shrinks the step to `0.2λ`
/// directly.
fn line_search<O: Objective>(
    core: &LbfgsCore,
    objective: &mut O,
    direction: &mut Array1<f64>,
) -> Result<bool, LbfgsError> {
    let old_parameters = objective.parameters();
    let gradient = objective.gradient();

    let norm = norm2(direction);
    if norm > core.max_step {
        *direction *= core.max_step / norm;
    }

    let slope = gradient.dot(direction);
    if !(slope > 0.0) {
        log::debug!("[LineSearch] rejecting direction with gᵀd = {slope:.3e}");
        return Ok(false);
    }

    // Smallest lambda at which every coordinate's proportional change falls
    // below the relative tolerance; trial steps under it are stagnation.
    let mut steepest = 0.0_f64;
    for i in 0..old_parameters.len() {
        let proportion = direction[i].abs() / old_parameters[i].abs().max(1.0);
        if proportion > steepest {
            steepest = proportion;
        }
    }
    let min_lambda = core.relative_tolerance / steepest;

    let initial_value = objective.value();
    let mut previous_value = initial_value;

    let mut lambda = 1.0_f64;
    let mut previous_lambda = 0.0_f64;

    for attempt in 0..core.max_search_iterations {
        let stagnated = direction
            .iter()
            .all(|d| (lambda * d).abs() <= core.absolute_tolerance);
        if lambda < min_lambda || stagnated {
            objective.set_parameters(old_parameters);
            return Ok(false);
        }

        objective.set_parameters(&old_parameters + &(lambda * &*direction));
        let value = objective.value();

        // Sufficient increase (Wolfe condition).
        if value >= initial_value + core.sufficient_increase * lambda * slope {
            if value < initial_value {
                return Err(LbfgsError::ValueDecreased {
                    value,
                    baseline: initial_value,
                });
            }
            log::debug!("[LineSearch] accepted λ = {lambda:.3e} after {} trials", attempt + 1);
            return Ok(true);
        }

        let trial = if value.is_infinite() || previous_value.is_infinite() {
            // Overflowing territory: shrink hard rather than interpolate.
            0.2 * lambda
        } else if attempt == 0 {
            // Quadratic model through (0, f0) with slope f'(0) and (λ, f(λ)).
            -slope / (2.0 * (value - initial_value - slope))
        } else {
            // Cubic model through the two most recent trials.
            let rhs1 = value - initial_value - lambda * slope;
            let rhs2 = previous_value - initial_value - previous_lambda * slope;
            let l2 = lambda * lambda;
            let p2 = previous_lambda * previous_lambda;
            let span = lambda - previous_lambda;
            let a = (rhs1 / l2 - rhs2 / p2) / span;
            let b = (-previous_lambda * rhs1 / l2 + lambda * rhs2 / p2) / span;
            let candidate = if a == 0.0 {
                -slope / (2.0 * b)
            } else {
                let discriminant = b * b - 3.0 * a * slope;
                if discriminant < 0.0 {
                    0.5 * lambda
                } else if b <= 0.0 {
                    (-b + discriminant.sqrt()) / (3.0 * a)
                } else {
                    -slope / (b + discriminant.sqrt())
                }
            };
            candidate.min(0.5 * lambda)
        };

        previous_lambda = lambda;
        previous_value = value;
        lambda = trial.max(0.1 * lambda);
    }

    objective.set_parameters(old_parameters);
    Ok(false)
}

#[cfg(test)]
mod tests {
    // The suite covers three areas:
    // 1. Convergence on well-behaved concave objectives, including the
    //    Poisson log-likelihood the solver was written for.
    // 2. Soft termination: stagnation, zero gradients, zero curvature,
    //    exhausted budgets, and re-entry after convergence.
    // 3. Hard failures: inconsistent gradients and dimension mismatches.

    use super::{
        line_search, FnObjective, History, Lbfgs, LbfgsCore, LbfgsError, Objective, RunStatus,
    };
    use ndarray::{array, Array1};
    use spectral::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    // --- Test objectives ---

    /// Concave quadratic with maximum at [1, 2].
    fn quadratic_value(theta: &Array1<f64>) -> f64 {
        -((theta[0] - 1.0).powi(2) + 2.0 * (theta[1] - 2.0).powi(2))
    }

    fn quadratic_gradient(theta: &Array1<f64>) -> Array1<f64> {
        array![-2.0 * (theta[0] - 1.0), -4.0 * (theta[1] - 2.0)]
    }

    fn quadratic_objective(
        start: Array1<f64>,
    ) -> FnObjective<fn(&Array1<f64>) -> f64, fn(&Array1<f64>) -> Array1<f64>> {
        FnObjective::new(start, quadratic_value, quadratic_gradient)
    }

    /// Ill-conditioned concave quadratic: the ridge along θ₁ is 1000x
    /// gentler than the wall along θ₀. Maximum at [3, -2].
    fn ridge_value(theta: &Array1<f64>) -> f64 {
        -(1000.0 * (theta[0] - 3.0).powi(2) + (theta[1] + 2.0).powi(2))
    }

    fn ridge_gradient(theta: &Array1<f64>) -> Array1<f64> {
        array![-2000.0 * (theta[0] - 3.0), -2.0 * (theta[1] + 2.0)]
    }

    /// Intercept-only Poisson log-likelihood over counts {1,2,3,4,5};
    /// maximized at θ = ln(mean) = ln 3.
    const COUNTS: [f64; 5] = [1.0, 2.0, 3.0, 4.0, 5.0];

    fn poisson_value(theta: &Array1<f64>) -> f64 {
        COUNTS.iter().map(|&x| x * theta[0] - theta[0].exp()).sum()
    }

    fn poisson_gradient(theta: &Array1<f64>) -> Array1<f64> {
        array![COUNTS.iter().map(|&x| x - theta[0].exp()).sum::<f64>()]
    }

    fn poisson_objective() -> FnObjective<fn(&Array1<f64>) -> f64, fn(&Array1<f64>) -> Array1<f64>>
    {
        FnObjective::new(array![0.0], poisson_value, poisson_gradient)
    }

    /// Unbounded linear objective; its gradient never changes, so the
    /// curvature history degenerates immediately.
    fn linear_value(theta: &Array1<f64>) -> f64 {
        2.0 * theta[0] + 3.0 * theta[1]
    }

    fn linear_gradient(_theta: &Array1<f64>) -> Array1<f64> {
        array![2.0, 3.0]
    }

    /// Concave quadratic whose maximum at 15 sits behind a wall of negative
    /// infinity starting at 10.
    fn walled_value(theta: &Array1<f64>) -> f64 {
        if theta[0] > 10.0 {
            f64::NEG_INFINITY
        } else {
            -((theta[0] - 15.0).powi(2))
        }
    }

    fn walled_gradient(theta: &Array1<f64>) -> Array1<f64> {
        array![-2.0 * (theta[0] - 15.0)]
    }

    fn tight<O: Objective>(solver: Lbfgs<O>) -> Lbfgs<O> {
        solver
            .with_gradient_tolerance(1e-5)
            .with_absolute_tolerance(1e-10)
            .with_relative_tolerance(1e-9)
            .with_value_tolerance(1e-12)
    }

    // --- 1. Convergence ---

    #[test]
    fn converges_on_concave_quadratic() {
        let mut solver = tight(Lbfgs::new(quadratic_objective(array![4.0, -3.0])));
        let solution = solver.run().unwrap();
        assert!(solution.status.is_converged());
        assert_that!(&solution.final_parameters[0]).is_close_to(1.0, 1e-4);
        assert_that!(&solution.final_parameters[1]).is_close_to(2.0, 1e-4);
        assert_that!(&solution.final_value).is_close_to(0.0, 1e-6);
    }

    #[test]
    fn converges_on_ill_conditioned_quadratic() {
        let objective = FnObjective::new(array![10.0, 10.0], ridge_value, ridge_gradient);
        let mut solver = tight(Lbfgs::new(objective)).with_max_iterations(500);
        let solution = solver.run().unwrap();
        assert!(solution.status.is_converged());
        assert_that!(&solution.final_parameters[0]).is_close_to(3.0, 1e-3);
        assert_that!(&solution.final_parameters[1]).is_close_to(-2.0, 1e-3);
    }

    #[test]
    fn poisson_intercept_recovers_log_mean() {
        let mut solver = Lbfgs::new(poisson_objective());
        let starting_value = solver.objective().value();
        let solution = solver.run().unwrap();
        assert!(matches!(
            solution.status,
            RunStatus::Converged | RunStatus::Stalled
        ));
        assert_that!(&solution.final_parameters[0]).is_close_to(3.0_f64.ln(), 5e-2);
        assert!(solution.final_value > starting_value);
    }

    #[test]
    fn objective_values_never_decrease_across_steps() {
        let mut solver = tight(Lbfgs::new(poisson_objective()));
        let mut values = vec![solver.objective().value()];
        for _ in 0..60 {
            let status = solver.optimize(1).unwrap();
            values.push(solver.objective().value());
            if status != RunStatus::ExhaustedBudget {
                break;
            }
        }
        assert!(values.len() > 2);
        for pair in values.windows(2) {
            assert!(
                pair[1] >= pair[0] - 1e-12,
                "value decreased from {} to {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn reoptimizing_after_convergence_leaves_parameters_alone() {
        let mut solver = tight(Lbfgs::new(quadratic_objective(array![4.0, -3.0])));
        let first = solver.run().unwrap();
        assert!(first.status.is_converged());

        let second = solver.optimize(10).unwrap();
        assert_eq!(second, RunStatus::Converged);
        assert_eq!(solver.objective().parameters(), first.final_parameters);
    }

    // --- 2. Line search behavior ---

    #[test]
    fn line_search_rejects_non_ascent_direction() {
        let core = LbfgsCore::default();
        let mut objective = quadratic_objective(array![4.0, -3.0]);
        let before = objective.parameters.clone();

        // Gradient at the start is [-6, 20]; this direction points downhill.
        let mut direction = array![6.0, -20.0];
        let improved = line_search(&core, &mut objective, &mut direction).unwrap();
        assert!(!improved);
        assert_eq!(objective.parameters, before);
    }

    #[test]
    fn line_search_caps_oversized_directions() {
        let core = LbfgsCore::default();
        let mut objective = FnObjective::new(
            array![0.0],
            |t: &Array1<f64>| -((t[0] - 5.0).powi(2)),
            |t: &Array1<f64>| array![-2.0 * (t[0] - 5.0)],
        );
        let mut direction = array![1000.0];
        line_search(&core, &mut objective, &mut direction).unwrap();
        assert_that!(&super::norm2(&direction)).is_close_to(core.max_step, 1e-9);
    }

    #[test]
    fn infinite_objective_values_shrink_the_step() {
        let objective = FnObjective::new(array![0.0], walled_value, walled_gradient);
        let mut solver = Lbfgs::new(objective);
        let solution = solver.run().unwrap();
        assert!(matches!(
            solution.status,
            RunStatus::Converged | RunStatus::Stalled
        ));
        assert!(solution.final_value.is_finite());
        assert!(solution.final_parameters[0] <= 10.0);
        assert!(solution.final_parameters[0] > 8.0);
    }

    // --- 3. History bounds ---

    #[test]
    fn history_evicts_oldest_entries_first() {
        let mut history = History::new(3);
        for k in 0..5 {
            let k = k as f64;
            history.push(array![k], array![-k], 1.0 / (k + 1.0));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.s[0][0], 2.0);
        assert_eq!(history.s[2][0], 4.0);
        assert_eq!(history.rho[0], 1.0 / 3.0);
        assert_eq!(history.rho[2], 1.0 / 5.0);
    }

    #[test]
    fn correction_history_stays_bounded_across_iterations() {
        let scales: Vec<f64> = (1..=10).map(|i| (i * i) as f64).collect();
        let value_scales = scales.clone();
        let gradient_scales = scales;
        let objective = FnObjective::new(
            Array1::from_elem(10, 1.0),
            move |t: &Array1<f64>| -t.iter().zip(&value_scales).map(|(x, c)| c * x * x).sum::<f64>(),
            move |t: &Array1<f64>| {
                t.iter()
                    .zip(&gradient_scales)
                    .map(|(x, c)| -2.0 * c * x)
                    .collect()
            },
        );
        let mut solver = tight(Lbfgs::new(objective))
            .with_history_depth(3)
            .with_max_iterations(200);
        solver.optimize(200).unwrap();

        let state = solver.state.as_ref().expect("at least one step was taken");
        assert!(state.iterations > 3);
        assert_eq!(state.history.len(), 3);
    }

    // --- 4. Soft termination ---

    #[test]
    fn zero_gradient_reports_stalled_immediately() {
        let evaluations = Rc::new(RefCell::new(0_usize));
        let counter = Rc::clone(&evaluations);
        let objective = FnObjective::new(
            array![1.5, -0.5],
            move |_: &Array1<f64>| {
                *counter.borrow_mut() += 1;
                5.0
            },
            |_: &Array1<f64>| array![0.0, 0.0],
        );
        let mut solver = Lbfgs::new(objective);
        let status = solver.optimize(10).unwrap();
        assert_eq!(status, RunStatus::Stalled);
        assert_eq!(solver.objective().parameters, array![1.5, -0.5]);
        // Stationarity is detected before any line search evaluates the value.
        assert_eq!(*evaluations.borrow(), 0);
    }

    #[test]
    fn zero_curvature_stalls_without_error() {
        let objective = FnObjective::new(array![0.0, 0.0], linear_value, linear_gradient);
        let mut solver = Lbfgs::new(objective);
        let starting_value = solver.objective().value();
        let status = solver.optimize(50).unwrap();
        assert_eq!(status, RunStatus::Stalled);
        // The initial gradient step was still taken and kept.
        assert!(solver.objective().value() > starting_value);
    }

    #[test]
    fn iteration_budget_returns_exhausted_status() {
        let mut solver = tight(Lbfgs::new(poisson_objective()));
        let status = solver.optimize(1).unwrap();
        assert_eq!(status, RunStatus::ExhaustedBudget);
        assert!(solver.objective().parameters[0] != 0.0);
    }

    // --- 5. Hard failures ---

    #[test]
    fn inconsistent_gradient_fails_fast() {
        // The value grows linearly while the reported gradient grows with
        // the parameters, so the very first curvature check sees sᵀy > 0.
        let objective = FnObjective::new(
            array![1.0],
            |t: &Array1<f64>| t[0],
            |t: &Array1<f64>| t.clone(),
        );
        let mut solver = Lbfgs::new(objective);
        let err = solver.optimize(10).unwrap_err();
        assert!(matches!(err, LbfgsError::CurvatureViolation { sy } if sy > 0.0));
    }

    #[test]
    fn mismatched_gradient_dimension_is_an_error() {
        let objective = FnObjective::new(
            array![1.0, 2.0],
            |t: &Array1<f64>| -t.dot(t),
            |t: &Array1<f64>| array![-2.0 * t[0]],
        );
        let mut solver = Lbfgs::new(objective);
        let err = solver.optimize(10).unwrap_err();
        assert!(matches!(
            err,
            LbfgsError::DimensionMismatch {
                parameters: 2,
                gradient: 1
            }
        ));
    }

    // --- 6. Progress reporting ---

    #[test]
    fn observer_sees_each_outer_iteration() {
        let notifications = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&notifications);
        let mut solver = Lbfgs::new(poisson_objective())
            .with_observer(move |iteration, budget| sink.borrow_mut().push((iteration, budget)));
        solver.run().unwrap();

        let notifications = notifications.borrow();
        assert!(!notifications.is_empty());
        assert_eq!(notifications[0], (0, 100));
        for (index, &(iteration, budget)) in notifications.iter().enumerate() {
            assert_eq!(iteration, index);
            assert_eq!(budget, 100);
        }
    }
}
