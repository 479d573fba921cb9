//! Engine layer: manifest to plan, plan display, plan execution

pub mod differ;
pub mod executor;
pub mod planner;

pub use executor::run_plan;
pub use planner::build_plan;
