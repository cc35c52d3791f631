//! Built-in pre-stages.

mod null_handler;
mod rolling_average;
mod temporal_expander;
mod type_caster;

pub use null_handler::NullHandler;
pub use rolling_average::RollingAverage;
pub use temporal_expander::TemporalExpander;
pub use type_caster::TypeCaster;
