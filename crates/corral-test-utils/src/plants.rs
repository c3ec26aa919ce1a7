//! Plant models shared by tests and demos.
//!
//! The small plants exercise individual filter mechanics with dynamics that
//! are easy to reason about by hand. [`TurbinePlatform`] is the realistic
//! fixture: a floating wind turbine modeled as an inverted pendulum with
//! rotor dynamics, nonlinear in the platform angle, the rotor speed, and
//! the blade pitch.

use corral_core::system::{Labels, Model};
use num_dual::DualNum;

// ---------------------------------------------------------------------------
// ScalarPlant
// ---------------------------------------------------------------------------

/// First-order lag `x' = u - x`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalarPlant;

impl Model for ScalarPlant {
    fn state_dim(&self) -> usize {
        1
    }

    fn input_dim(&self) -> usize {
        1
    }

    fn param_dim(&self) -> usize {
        0
    }

    fn derivative<D: DualNum<f64> + Copy>(&self, x: &[D], u: &[D], _p: &[f64]) -> Vec<D> {
        vec![u[0] - x[0]]
    }
}

// ---------------------------------------------------------------------------
// DoubleIntegrator
// ---------------------------------------------------------------------------

/// Position and velocity under direct acceleration: `x' = [x1, u]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoubleIntegrator;

impl Model for DoubleIntegrator {
    fn state_dim(&self) -> usize {
        2
    }

    fn input_dim(&self) -> usize {
        1
    }

    fn param_dim(&self) -> usize {
        0
    }

    fn derivative<D: DualNum<f64> + Copy>(&self, x: &[D], u: &[D], _p: &[f64]) -> Vec<D> {
        vec![x[1], u[0]]
    }
}

// ---------------------------------------------------------------------------
// HarmonicOscillator
// ---------------------------------------------------------------------------

/// Forced oscillator `x'' = -omega^2 x + u`, useful for checking that
/// integration closes a full period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarmonicOscillator {
    pub omega: f64,
}

impl Model for HarmonicOscillator {
    fn state_dim(&self) -> usize {
        2
    }

    fn input_dim(&self) -> usize {
        1
    }

    fn param_dim(&self) -> usize {
        0
    }

    fn derivative<D: DualNum<f64> + Copy>(&self, x: &[D], u: &[D], _p: &[f64]) -> Vec<D> {
        let omega_sq = self.omega * self.omega;
        vec![x[1], u[0] - x[0] * omega_sq]
    }
}

// ---------------------------------------------------------------------------
// TurbinePlatform
// ---------------------------------------------------------------------------

const G: f64 = 9.81;
/// Lever arm from the rotation point to the thruster and mooring line.
const L_P: f64 = 50.0;
/// Center of mass below the rotation point.
const L_COM: f64 = 6.0;
/// Platform, hub, and nacelle masses.
const PLATFORM_MASS: f64 = 1.7838e7 + 190_000.0 + 507_275.0;
const MOORING_K: f64 = 4.5e4;
const PLATFORM_J: f64 = 2.0 * 1.2507e10 + PLATFORM_MASS * L_COM * L_COM;

const TIP_LOSS: f64 = 0.94;
const LAMBDA_STAR: f64 = 7.5;
const CP_STAR: f64 = 0.48;
const CF: f64 = 0.0145;
const AIR_RHO: f64 = 1.225;
const ROTOR_R: f64 = 63.0;
const ROTOR_J: f64 = 4e7;

const PI: f64 = std::f64::consts::PI;

/// Aerodynamic force and torque coefficients.
const K_T: f64 =
    2.0 * AIR_RHO * PI * (TIP_LOSS * ROTOR_R) * (TIP_LOSS * ROTOR_R) * ROTOR_R / (3.0 * LAMBDA_STAR);
const L_T: f64 = 2.0 / 3.0 * TIP_LOSS * ROTOR_R;
const B_D: f64 = 0.5
    * AIR_RHO
    * PI
    * ROTOR_R
    * ROTOR_R
    * (TIP_LOSS * TIP_LOSS * 16.0 / 27.0 - CP_STAR)
    * (ROTOR_R / LAMBDA_STAR)
    * (ROTOR_R / LAMBDA_STAR)
    * (ROTOR_R / LAMBDA_STAR);
const D_T: f64 = 0.5 * AIR_RHO * PI * ROTOR_R * ROTOR_R * CF;

/// Critical mooring damping, `2 sqrt(m k)`.
fn mooring_damping() -> f64 {
    2.0 * (PLATFORM_MASS * MOORING_K).sqrt()
}

/// Floating wind turbine on a moored spar platform.
///
/// State is `[platform angle, platform rate, rotor speed]`, input is
/// `[thruster force, blade pitch]`, and the single exogenous parameter is
/// the wind speed at hub height. The wind force couples the rotor speed
/// into the platform, so the robust linearization spans both the wind
/// bounds and the rotor operating range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurbinePlatform;

impl TurbinePlatform {
    /// Thruster force bound in newtons.
    pub const MAX_THRUST: f64 = 1e6;
    /// Blade pitch bound in radians.
    pub const MAX_BLADE_PITCH: f64 = 40.0 * PI / 180.0;
}

impl Model for TurbinePlatform {
    fn state_dim(&self) -> usize {
        3
    }

    fn input_dim(&self) -> usize {
        2
    }

    fn param_dim(&self) -> usize {
        1
    }

    fn derivative<D: DualNum<f64> + Copy>(&self, x: &[D], u: &[D], p: &[f64]) -> Vec<D> {
        let wind = p[0];
        let theta = x[0];
        let theta_dot = x[1];
        let omega = x[2];
        let thrust = u[0];
        let pitch = u[1];

        // |omega| * omega with the sign taken from the real part, so the
        // dual sweep carries the one-sided slope through the drag term.
        let omega_sign = if omega.re() < 0.0 { -1.0 } else { 1.0 };
        let signed_omega_sq = omega * omega * omega_sign;

        let wind_force = pitch.cos() * (K_T * wind) * omega
            - pitch.sin() * (K_T * L_T) * omega * omega
            + D_T * wind.abs() * wind;
        let wind_torque = pitch.cos() * (K_T * wind * wind)
            - pitch.sin() * (K_T * L_T * wind) * omega
            - signed_omega_sq * B_D;

        let platform_torque = theta.sin() * theta.cos() * (-MOORING_K * L_P * L_P)
            + theta.sin() * (-PLATFORM_MASS * G * L_COM)
            + theta.cos() * theta_dot * (-mooring_damping() * L_P)
            + theta.cos() * thrust * L_P
            + wind_force;

        vec![
            theta_dot,
            platform_torque * (1.0 / PLATFORM_J),
            wind_torque * (1.0 / ROTOR_J),
        ]
    }

    fn labels(&self) -> Labels {
        Labels::new(
            &["platform", "platform_rate", "rotor"],
            &["thrust", "pitch"],
            &["wind"],
        )
    }

    fn linearization_variables(&self) -> Vec<String> {
        vec!["wind".to_string(), "rotor".to_string()]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
