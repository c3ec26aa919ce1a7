//! Floating wind turbine safety filter demo.
//!
//! Provides two modes of operation:
//! - `run`: Drive a reckless seeded agent through the filter and print
//!   the applied corrections cycle by cycle
//! - `info`: Print workspace crate versions and configuration

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nalgebra::{dvector, DMatrix, DVector};

use corral_core::config::{FilterConfig, ParameterBounds, SolverSettings, Weights};
use corral_core::polytope::{Constraints, Polytope};
use corral_filter::{CalcOptions, LinearizationPoint, SafetyFilter, Stepper};
use corral_test_utils::oracle::LqrOracle;
use corral_test_utils::plants::TurbinePlatform;
use corral_test_utils::{reckless_actions, wind_profile};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Predictive safety filter demo on a floating wind turbine.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the closed loop and print corrections.
    Run {
        /// Number of filter cycles to run.
        #[arg(short = 'n', long, default_value_t = 60)]
        cycles: u32,

        /// Random seed for the agent.
        #[arg(short, long, default_value_t = 7)]
        seed: u64,

        /// Mean wind speed in m/s.
        #[arg(short, long, default_value_t = 13.0)]
        wind: f64,

        /// Filter configuration TOML; defaults are used when absent.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print crate information.
    Info,
}

// ---------------------------------------------------------------------------
// Demo fixture
// ---------------------------------------------------------------------------

/// Platform angle limit in radians (15 degrees).
const MAX_PLATFORM_ANGLE: f64 = 0.2618;
/// Platform angular rate limit in rad/s.
const MAX_PLATFORM_RATE: f64 = 0.15;
/// Rotor speed limit in rad/s.
const MAX_ROTOR_SPEED: f64 = 2.5;

fn demo_config() -> FilterConfig {
    FilterConfig {
        slew_rate: Some(vec![5.0e5, 0.2]),
        cache_dir: PathBuf::from(".corral-cache"),
        // Thrust entries sit at 1e5 scale, so the default step tolerance
        // would chase solver noise.
        solver: SolverSettings {
            step_tol: 1e-2,
            ..SolverSettings::default()
        },
        ..FilterConfig::default()
    }
}

fn demo_constraints() -> Constraints {
    let state = Polytope::symmetric_box(&[MAX_PLATFORM_ANGLE, MAX_PLATFORM_RATE, MAX_ROTOR_SPEED])
        .expect("valid state box");
    let input = Polytope::symmetric_box(&[
        TurbinePlatform::MAX_THRUST,
        TurbinePlatform::MAX_BLADE_PITCH,
    ])
    .expect("valid input box");
    Constraints::new(state, input)
}

/// Input deviation weight normalizing each channel by its range.
fn demo_input_cost() -> DMatrix<f64> {
    let thrust = TurbinePlatform::MAX_THRUST;
    let pitch = TurbinePlatform::MAX_BLADE_PITCH;
    DMatrix::from_diagonal(&dvector![1.0 / (thrust * thrust), 1.0 / (pitch * pitch)])
}

// ---------------------------------------------------------------------------
// Mode implementations
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_lines)]
fn run_demo(cycles: u32, seed: u64, mean_wind: f64, config_path: Option<PathBuf>) {
    let config = match config_path {
        Some(path) => FilterConfig::from_file(&path).expect("failed to load filter config"),
        None => demo_config(),
    };
    let bounds: ParameterBounds = HashMap::from([
        ("wind".to_string(), [10.0, 20.0]),
        ("rotor".to_string(), [0.3, 2.0]),
    ]);
    let weights = Weights {
        input: Some(demo_input_cost()),
        ..Weights::default()
    };
    let oracle = LqrOracle::new(DMatrix::identity(3, 3), demo_input_cost());

    let mut filter = SafetyFilter::new(
        TurbinePlatform,
        demo_constraints(),
        &bounds,
        &weights,
        config,
        &oracle,
    )
    .expect("failed to build safety filter");

    let interval = filter.config().command_interval;
    let stepper = Stepper::new(filter.config().discretization, interval);

    let candidates = reckless_actions(
        &[TurbinePlatform::MAX_THRUST, TurbinePlatform::MAX_BLADE_PITCH],
        cycles as usize,
        seed,
    );
    let winds = wind_profile(mean_wind, (10.0, 20.0), cycles as usize, seed);

    println!(
        "corral demo: {} cycles at {:.1} s, wind around {:.1} m/s, seed {}",
        cycles, interval, mean_wind, seed
    );

    // Platform at rest with the rotor near rated speed.
    let mut state = dvector![0.0, 0.0, 1.0];
    let mut previous = DVector::zeros(2);
    let mut corrected = 0u32;
    let mut fallbacks = 0u32;
    let mut total_rounds = 0usize;
    let mut total_solve_us = 0u64;

    for cycle in 0..cycles as usize {
        let wind_speed = winds[cycle];
        let wind = dvector![wind_speed];
        let candidate = &candidates[cycle];
        let stabilizing = filter.terminal_set().feedback(&state);
        let options = CalcOptions {
            previous_input: Some(previous.clone()),
            ..CalcOptions::default()
        };

        let action = match filter.calc(&state, candidate, &stabilizing, &wind, &options) {
            Ok(correction) => {
                total_rounds += correction.rounds;
                total_solve_us += correction.solve_time_us;
                let delta = &correction.action - candidate;
                let changed = delta[0].abs() > 1e3 || delta[1].abs() > 1e-3;
                if changed {
                    corrected += 1;
                }
                println!(
                    "cycle {cycle:3}: wind={wind_speed:5.2}  candidate=({:+9.0} N, {:+6.3} rad)  \
                     applied=({:+9.0} N, {:+6.3} rad){}",
                    candidate[0],
                    candidate[1],
                    correction.action[0],
                    correction.action[1],
                    if changed { "  *" } else { "" }
                );
                correction.action
            }
            Err(e) => {
                eprintln!("cycle {cycle:3}: solve failed ({e}); applying stabilizing input");
                filter.reset_init_guess();
                fallbacks += 1;
                stabilizing.clone()
            }
        };

        let lin = LinearizationPoint {
            state: state.clone(),
            input: action.clone(),
        };
        state = stepper.predict_vec(&TurbinePlatform, &state, &action, &wind, &lin);
        previous = action;

        log::debug!(
            "cycle {cycle}: platform=({:+.4} rad, {:+.4} rad/s), rotor={:.3} rad/s",
            state[0],
            state[1],
            state[2]
        );
    }

    let solved = cycles - fallbacks;
    println!(
        "\ntotal: cycles={cycles}, corrected={corrected}, fallbacks={fallbacks}"
    );
    if solved > 0 {
        println!(
            "solver: mean rounds={:.1}, mean solve={:.2} ms",
            total_rounds as f64 / f64::from(solved),
            total_solve_us as f64 / f64::from(solved) / 1000.0
        );
    }
    println!(
        "final state: platform=({:+.4} rad, {:+.4} rad/s), rotor={:.3} rad/s",
        state[0], state[1], state[2]
    );
}

fn run_info() {
    println!("corral v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("crates:");
    println!("  corral-core       {}", env!("CARGO_PKG_VERSION"));
    println!("  corral-filter     {}", env!("CARGO_PKG_VERSION"));
    println!("  corral-test-utils {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("edition: 2024");
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run {
            cycles,
            seed,
            wind,
            config,
        }) => run_demo(cycles, seed, wind, config),
        Some(Commands::Info) => run_info(),
        None => {
            // Default: run with defaults
            run_demo(60, 7, 13.0, None);
        }
    }
}
