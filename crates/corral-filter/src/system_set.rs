//! Vertex enumeration of the linearized dynamics over the parameter box.
//!
//! Each variable the plant names for robust linearization spans an interval;
//! the Cartesian product of interval endpoints gives `2^k` vertices, and the
//! plant is linearized at every one. The terminal-set oracle must certify
//! its set against the whole family.

use corral_core::config::ParameterBounds;
use corral_core::error::ConfigError;
use corral_core::system::{LinearSystem, Model, Slot};
use nalgebra::DVector;

/// Cap on enumerated variables; the vertex count is `2^k`.
pub const MAX_VERTEX_VARIABLES: usize = 16;

/// Linearize the plant at every vertex of the parameter box.
///
/// Variables come from [`Model::linearization_variables`] and are resolved
/// against the plant labels; unnamed entries stay at zero. The first listed
/// variable toggles slowest, the last fastest, with the lower endpoint
/// visited first. An empty variable list yields the single system
/// linearized at the origin.
pub fn vertex_systems<M: Model + ?Sized>(
    model: &M,
    bounds: &ParameterBounds,
) -> Result<Vec<LinearSystem>, ConfigError> {
    let labels = model.labels();
    let variables = model.linearization_variables();
    if variables.len() > MAX_VERTEX_VARIABLES {
        return Err(ConfigError::InvalidValue {
            field: "linearization_variables".into(),
            message: format!(
                "{} variables would enumerate 2^{} vertices (cap is {MAX_VERTEX_VARIABLES})",
                variables.len(),
                variables.len()
            ),
        });
    }

    let mut spans = Vec::with_capacity(variables.len());
    for name in &variables {
        let slot = labels
            .resolve(name)
            .ok_or_else(|| ConfigError::UnknownVariable(name.clone()))?;
        let [lo, hi] = *bounds
            .get(name)
            .ok_or_else(|| ConfigError::MissingBound(name.clone()))?;
        if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
            return Err(ConfigError::InvalidValue {
                field: name.clone(),
                message: format!("bound [{lo}, {hi}] is not a finite interval"),
            });
        }
        spans.push((slot, lo, hi));
    }

    let k = spans.len();
    let mut systems = Vec::with_capacity(1 << k);
    for mask in 0..(1_usize << k) {
        let mut x = DVector::zeros(model.state_dim());
        let mut u = DVector::zeros(model.input_dim());
        let mut p = DVector::zeros(model.param_dim());
        for (j, &(slot, lo, hi)) in spans.iter().enumerate() {
            let high = (mask >> (k - 1 - j)) & 1 == 1;
            let value = if high { hi } else { lo };
            match slot {
                Slot::State(i) => x[i] = value,
                Slot::Input(i) => u[i] = value,
                Slot::Param(i) => p[i] = value,
            }
        }
        let (a, b) = model.jacobians(&x, &u, &p);
        systems.push(LinearSystem { a, b });
    }

    log::debug!(
        "linearized {} vertex systems over {} variables",
        systems.len(),
        k
    );
    Ok(systems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use corral_core::system::Labels;
    use num_dual::DualNum;

    /// Plant whose Jacobian exposes the vertex point: df0/dx0 = p0 and
    /// df1/dx1 = u0.
    struct Probe;

    impl Model for Probe {
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
            vec![x[0] * p[0], x[1] * u[0]]
        }

        fn linearization_variables(&self) -> Vec<String> {
            vec!["p0".to_string(), "u0".to_string()]
        }
    }

    fn probe_bounds() -> ParameterBounds {
        let mut bounds = ParameterBounds::new();
        bounds.insert("p0".to_string(), [1.0, 2.0]);
        bounds.insert("u0".to_string(), [-1.0, 1.0]);
        bounds
    }

    #[test]
    fn enumerates_every_vertex_in_order() {
        let systems = vertex_systems(&Probe, &probe_bounds()).unwrap();
        assert_eq!(systems.len(), 4);

        // First variable (p0) slowest, second (u0) fastest, low endpoint first.
        let p0_values: Vec<f64> = systems.iter().map(|s| s.a[(0, 0)]).collect();
        let u0_values: Vec<f64> = systems.iter().map(|s| s.a[(1, 1)]).collect();
        assert_eq!(p0_values, vec![1.0, 1.0, 2.0, 2.0]);
        assert_eq!(u0_values, vec![-1.0, 1.0, -1.0, 1.0]);
    }

    #[test]
    fn empty_variable_list_linearizes_at_origin() {
        struct Fixed;

        impl Model for Fixed {
            fn state_dim(&self) -> usize {
                1
            }

            fn input_dim(&self) -> usize {
                1
            }

            fn param_dim(&self) -> usize {
                0
            }

            fn derivative<D: DualNum<f64> + Copy>(
                &self,
                x: &[D],
                u: &[D],
                _p: &[f64],
            ) -> Vec<D> {
                vec![x[0] * -0.5 + u[0]]
            }
        }

        let systems = vertex_systems(&Fixed, &ParameterBounds::new()).unwrap();
        assert_eq!(systems.len(), 1);
        assert_relative_eq!(systems[0].a[(0, 0)], -0.5);
        assert_relative_eq!(systems[0].b[(0, 0)], 1.0);
    }

    #[test]
    fn unknown_variable_is_rejected() {
        struct Misnamed;

        impl Model for Misnamed {
            fn state_dim(&self) -> usize {
                1
            }

            fn input_dim(&self) -> usize {
                1
            }

            fn param_dim(&self) -> usize {
                0
            }

            fn derivative<D: DualNum<f64> + Copy>(
                &self,
                x: &[D],
                _u: &[D],
                _p: &[f64],
            ) -> Vec<D> {
                vec![x[0]]
            }

            fn labels(&self) -> Labels {
                Labels::new(&["height"], &["force"], &[])
            }

            fn linearization_variables(&self) -> Vec<String> {
                vec!["altitude".to_string()]
            }
        }

        let err = vertex_systems(&Misnamed, &ParameterBounds::new()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownVariable(name) if name == "altitude"));
    }

    #[test]
    fn missing_bound_is_rejected() {
        let mut bounds = probe_bounds();
        bounds.remove("u0");
        let err = vertex_systems(&Probe, &bounds).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBound(name) if name == "u0"));
    }

    #[test]
    fn reversed_interval_is_rejected() {
        let mut bounds = probe_bounds();
        bounds.insert("p0".to_string(), [2.0, 1.0]);
        let err = vertex_systems(&Probe, &bounds).unwrap_err();
        assert!(err.to_string().contains("not a finite interval"));
    }
}
