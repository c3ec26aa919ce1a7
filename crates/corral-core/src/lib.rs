// corral-core: Plant models, polytopes, terminal sets, config, errors for the corral safety filter.

pub mod config;
pub mod error;
pub mod polytope;
pub mod system;
pub mod terminal;
