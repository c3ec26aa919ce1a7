use nalgebra::{DMatrix, DVector};
use num_dual::{Dual64, DualNum};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Continuous-time plant `xdot = f(x, u, p)`.
///
/// The derivative is written once over the generic scalar `D` and evaluated
/// two ways: with `D = f64` for rollouts and with `D = Dual64` for the
/// forward-mode Jacobian sweep. Exogenous parameters `p` stay plain `f64`
/// because the filter never differentiates with respect to them.
pub trait Model {
    /// Number of state entries.
    fn state_dim(&self) -> usize;

    /// Number of input entries.
    fn input_dim(&self) -> usize;

    /// Number of exogenous parameter entries.
    fn param_dim(&self) -> usize;

    /// Continuous-time derivative of the state.
    ///
    /// Must return exactly `state_dim()` entries.
    fn derivative<D: DualNum<f64> + Copy>(&self, x: &[D], u: &[D], p: &[f64]) -> Vec<D>;

    /// Names for state, input, and parameter entries.
    ///
    /// Linearization variables are resolved against these names. The default
    /// is numbered labels (`x0`, `u0`, `p0`, ...).
    fn labels(&self) -> Labels {
        Labels::numbered(self.state_dim(), self.input_dim(), self.param_dim())
    }

    /// Variables whose bounds span the vertex box for robust linearization.
    ///
    /// Empty (the default) means the plant is treated as a single system
    /// linearized at the origin.
    fn linearization_variables(&self) -> Vec<String> {
        Vec::new()
    }

    /// Jacobians `(df/dx, df/du)` of the derivative at a point.
    ///
    /// The default runs a forward-mode dual-number sweep, one column per
    /// perturbed entry. Plants with closed-form Jacobians can override.
    fn jacobians(
        &self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        p: &DVector<f64>,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        dual_jacobians(self, x, u, p)
    }
}

/// Forward-mode Jacobian sweep of [`Model::derivative`].
///
/// Perturbs one entry at a time with a unit dual part and reads the columns
/// of `df/dx` and `df/du` off the dual parts of the output.
pub fn dual_jacobians<M: Model + ?Sized>(
    model: &M,
    x: &DVector<f64>,
    u: &DVector<f64>,
    p: &DVector<f64>,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let nx = model.state_dim();
    let nu = model.input_dim();
    let xd: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
    let ud: Vec<Dual64> = u.iter().map(|&v| Dual64::from(v)).collect();
    let pv = p.as_slice();

    let mut a = DMatrix::zeros(nx, nx);
    for j in 0..nx {
        let mut probe = xd.clone();
        probe[j].eps = 1.0;
        let f = model.derivative(&probe, &ud, pv);
        assert_eq!(f.len(), nx, "Derivative length mismatch");
        for i in 0..nx {
            a[(i, j)] = f[i].eps;
        }
    }

    let mut b = DMatrix::zeros(nx, nu);
    for j in 0..nu {
        let mut probe = ud.clone();
        probe[j].eps = 1.0;
        let f = model.derivative(&xd, &probe, pv);
        for i in 0..nx {
            b[(i, j)] = f[i].eps;
        }
    }

    (a, b)
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Where a named variable lives in the `(x, u, p)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    State(usize),
    Input(usize),
    Param(usize),
}

/// Names for the entries of state, input, and parameter vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub state: Vec<String>,
    pub input: Vec<String>,
    pub param: Vec<String>,
}

impl Labels {
    /// Labels from string slices, in entry order.
    pub fn new(state: &[&str], input: &[&str], param: &[&str]) -> Self {
        Self {
            state: state.iter().map(|s| (*s).to_string()).collect(),
            input: input.iter().map(|s| (*s).to_string()).collect(),
            param: param.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Numbered fallback labels: `x0..`, `u0..`, `p0..`.
    pub fn numbered(nx: usize, nu: usize, np: usize) -> Self {
        Self {
            state: (0..nx).map(|i| format!("x{i}")).collect(),
            input: (0..nu).map(|i| format!("u{i}")).collect(),
            param: (0..np).map(|i| format!("p{i}")).collect(),
        }
    }

    /// Find a variable by name, searching state, then input, then parameters.
    pub fn resolve(&self, name: &str) -> Option<Slot> {
        if let Some(i) = self.state.iter().position(|s| s == name) {
            return Some(Slot::State(i));
        }
        if let Some(i) = self.input.iter().position(|s| s == name) {
            return Some(Slot::Input(i));
        }
        self.param.iter().position(|s| s == name).map(Slot::Param)
    }
}

// ---------------------------------------------------------------------------
// LinearSystem
// ---------------------------------------------------------------------------

/// Continuous-time pair `(A, B)` linearized at one vertex of the parameter box.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSystem {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    /// Damped pendulum with torque input and a gravity-scale parameter.
    struct Pendulum;

    impl Model for Pendulum {
        fn state_dim(&self) -> usize {
            2
        }

        fn input_dim(&self) -> usize {
            1
        }

        fn param_dim(&self) -> usize {
            1
        }

        fn derivative<D: DualNum<f64> + Copy>(&self, x: &[D], u: &[D], p: &[f64]) -> Vec<D> {
            let damping = 0.1;
            vec![x[1], -x[0].sin() * p[0] - x[1] * damping + u[0]]
        }

        fn labels(&self) -> Labels {
            Labels::new(&["angle", "rate"], &["torque"], &["gravity"])
        }
    }

    #[test]
    fn numbered_labels_cover_all_entries() {
        let labels = Labels::numbered(2, 1, 3);
        assert_eq!(labels.state, vec!["x0", "x1"]);
        assert_eq!(labels.input, vec!["u0"]);
        assert_eq!(labels.param, vec!["p0", "p1", "p2"]);
    }

    #[test]
    fn resolve_searches_state_then_input_then_param() {
        let labels = Pendulum.labels();
        assert_eq!(labels.resolve("angle"), Some(Slot::State(0)));
        assert_eq!(labels.resolve("rate"), Some(Slot::State(1)));
        assert_eq!(labels.resolve("torque"), Some(Slot::Input(0)));
        assert_eq!(labels.resolve("gravity"), Some(Slot::Param(0)));
        assert_eq!(labels.resolve("missing"), None);
    }

    #[test]
    fn dual_sweep_matches_hand_derived_jacobians() {
        let x = dvector![0.4, -0.3];
        let u = dvector![0.2];
        let p = dvector![9.81];
        let (a, b) = Pendulum.jacobians(&x, &u, &p);

        assert_eq!(a.shape(), (2, 2));
        assert_eq!(b.shape(), (2, 1));
        assert_relative_eq!(a[(0, 0)], 0.0);
        assert_relative_eq!(a[(0, 1)], 1.0);
        assert_relative_eq!(a[(1, 0)], -0.4_f64.cos() * 9.81, epsilon = 1e-12);
        assert_relative_eq!(a[(1, 1)], -0.1);
        assert_relative_eq!(b[(0, 0)], 0.0);
        assert_relative_eq!(b[(1, 0)], 1.0);
    }

    #[test]
    fn plain_evaluation_matches_dual_real_part() {
        let x = [0.4, -0.3];
        let u = [0.2];
        let p = [9.81];
        let plain = Pendulum.derivative(&x, &u, &p);

        let xd: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
        let ud: Vec<Dual64> = u.iter().map(|&v| Dual64::from(v)).collect();
        let dual = Pendulum.derivative(&xd, &ud, &p);

        for (lhs, rhs) in plain.iter().zip(&dual) {
            assert_relative_eq!(*lhs, rhs.re, epsilon = 1e-15);
        }
    }
}
