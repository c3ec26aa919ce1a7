//! One-stage discretization of the continuous plant.
//!
//! Two schemes are offered: chained classical Runge-Kutta steps for
//! nonlinear accuracy, and an explicit first-order Taylor step that freezes
//! the Jacobians at a linearization point. Both propagate through the
//! generic scalar of [`Model::derivative`], so the same code path yields
//! plain rollouts (`f64`) and exact discrete Jacobians (`Dual64`).

use corral_core::config::Discretization;
use corral_core::system::Model;
use nalgebra::{DMatrix, DVector};
use num_dual::{Dual64, DualNum};

/// Runge-Kutta substeps per prediction stage.
const RK_SUBSTEPS: usize = 4;

/// Point the Taylor scheme freezes its Jacobians at.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearizationPoint {
    pub state: DVector<f64>,
    pub input: DVector<f64>,
}

/// Discrete one-stage propagator `x+ = F(x, u, p)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stepper {
    /// Four chained classical RK4 steps of size `dt / 4`.
    RungeKutta { dt: f64 },
    /// `x+ = (I + dt A) x + dt B u` with `(A, B)` evaluated at the
    /// linearization point.
    Taylor { dt: f64 },
}

impl Stepper {
    /// Stepper for a configured scheme and stage step.
    pub fn new(scheme: Discretization, dt: f64) -> Self {
        match scheme {
            Discretization::RungeKutta => Self::RungeKutta { dt },
            Discretization::Taylor => Self::Taylor { dt },
            Discretization::Continuous(never) => match never {},
        }
    }

    /// Stage step in seconds.
    pub const fn dt(&self) -> f64 {
        match *self {
            Self::RungeKutta { dt } | Self::Taylor { dt } => dt,
        }
    }

    /// Propagate one stage on dual-capable scalars.
    pub fn predict<M: Model + ?Sized, D: DualNum<f64> + Copy>(
        &self,
        model: &M,
        x: &[D],
        u: &[D],
        p: &[f64],
        lin: &LinearizationPoint,
    ) -> Vec<D> {
        match *self {
            Self::RungeKutta { dt } => rk4_chain(model, x, u, p, dt),
            Self::Taylor { dt } => taylor_step(model, x, u, p, lin, dt),
        }
    }

    /// Propagate one stage on plain vectors.
    pub fn predict_vec<M: Model + ?Sized>(
        &self,
        model: &M,
        x: &DVector<f64>,
        u: &DVector<f64>,
        p: &DVector<f64>,
        lin: &LinearizationPoint,
    ) -> DVector<f64> {
        let next = self.predict(model, x.as_slice(), u.as_slice(), p.as_slice(), lin);
        DVector::from_vec(next)
    }

    /// Discrete Jacobians `(dF/dx, dF/du)` at a point.
    ///
    /// The Taylor scheme has them in closed form. Runge-Kutta runs the
    /// forward dual sweep through `predict`, which differentiates the whole
    /// substep chain.
    pub fn jacobians_at<M: Model + ?Sized>(
        &self,
        model: &M,
        x: &DVector<f64>,
        u: &DVector<f64>,
        p: &DVector<f64>,
        lin: &LinearizationPoint,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        match *self {
            Self::Taylor { dt } => {
                let (a_c, b_c) = model.jacobians(&lin.state, &lin.input, p);
                let nx = model.state_dim();
                (DMatrix::identity(nx, nx) + a_c * dt, b_c * dt)
            }
            Self::RungeKutta { .. } => {
                let nx = model.state_dim();
                let nu = model.input_dim();
                let xd: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
                let ud: Vec<Dual64> = u.iter().map(|&v| Dual64::from(v)).collect();
                let pv = p.as_slice();

                let mut a = DMatrix::zeros(nx, nx);
                for j in 0..nx {
                    let mut probe = xd.clone();
                    probe[j].eps = 1.0;
                    let f = self.predict(model, &probe, &ud, pv, lin);
                    for i in 0..nx {
                        a[(i, j)] = f[i].eps;
                    }
                }

                let mut b = DMatrix::zeros(nx, nu);
                for j in 0..nu {
                    let mut probe = ud.clone();
                    probe[j].eps = 1.0;
                    let f = self.predict(model, &xd, &probe, pv, lin);
                    for i in 0..nx {
                        b[(i, j)] = f[i].eps;
                    }
                }

                (a, b)
            }
        }
    }
}

fn rk4_chain<M: Model + ?Sized, D: DualNum<f64> + Copy>(
    model: &M,
    x: &[D],
    u: &[D],
    p: &[f64],
    dt: f64,
) -> Vec<D> {
    #[allow(clippy::cast_precision_loss)]
    let h = dt / RK_SUBSTEPS as f64;
    let mut state = x.to_vec();
    for _ in 0..RK_SUBSTEPS {
        state = rk4_step(model, &state, u, p, h);
    }
    state
}

fn rk4_step<M: Model + ?Sized, D: DualNum<f64> + Copy>(
    model: &M,
    x: &[D],
    u: &[D],
    p: &[f64],
    h: f64,
) -> Vec<D> {
    let k1 = model.derivative(x, u, p);
    let mid1: Vec<D> = x
        .iter()
        .zip(k1.iter())
        .map(|(&xi, &ki)| xi + ki * (h / 2.0))
        .collect();
    let k2 = model.derivative(&mid1, u, p);
    let mid2: Vec<D> = x
        .iter()
        .zip(k2.iter())
        .map(|(&xi, &ki)| xi + ki * (h / 2.0))
        .collect();
    let k3 = model.derivative(&mid2, u, p);
    let end: Vec<D> = x
        .iter()
        .zip(k3.iter())
        .map(|(&xi, &ki)| xi + ki * h)
        .collect();
    let k4 = model.derivative(&end, u, p);

    (0..x.len())
        .map(|i| x[i] + (k1[i] + k2[i] * 2.0 + k3[i] * 2.0 + k4[i]) * (h / 6.0))
        .collect()
}

fn taylor_step<M: Model + ?Sized, D: DualNum<f64> + Copy>(
    model: &M,
    x: &[D],
    u: &[D],
    p: &[f64],
    lin: &LinearizationPoint,
    dt: f64,
) -> Vec<D> {
    let p_vec = DVector::from_column_slice(p);
    let (a_c, b_c) = model.jacobians(&lin.state, &lin.input, &p_vec);
    let nx = x.len();
    let nu = u.len();
    let a_d = DMatrix::identity(nx, nx) + a_c * dt;
    let b_d = b_c * dt;

    (0..nx)
        .map(|r| {
            let mut value = x[0] * a_d[(r, 0)];
            for c in 1..nx {
                value = value + x[c] * a_d[(r, c)];
            }
            for c in 0..nu {
                value = value + u[c] * b_d[(r, c)];
            }
            value
        })
        .collect()
}
