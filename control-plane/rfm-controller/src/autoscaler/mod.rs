pub mod batch;
pub mod estimator;
pub mod hysteresis;
pub mod queue;
pub mod reservations;

pub use batch::{BatchScaler, ReservationApplier, ScaleTarget, TriggerAmount};
pub use estimator::{Demand, EstimatorError, EstimatorInput, estimate};
pub use hysteresis::{HysteresisInput, apply_hysteresis};
pub use queue::WorkQueue;
pub use reservations::{apply_triggers, valid_sum};
