//! Domain types shared across the orchestration core.

pub mod error;
pub mod healing;
pub mod health;
pub mod operation;
pub mod weights;

pub use error::{ErrorClass, ErrorKind, PipelineError};
pub use healing::{HealingEvent, HealingOutcome, Strategy};
pub use health::{CircuitState, ComponentHealth, ComponentStatus, HealthSnapshot, SystemState};
pub use operation::{fingerprint, Operation, OperationKind, OperationStatus};
pub use weights::{WeightBounds, WeightTable};
