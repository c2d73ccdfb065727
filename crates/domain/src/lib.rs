pub mod entities;
pub mod ports;
pub mod repositories;
pub mod trigger;
pub mod value_objects;

pub use entities::*;
pub use ports::*;
pub use repositories::*;
pub use scheduler_core::{SchedulerError, SchedulerResult};
pub use trigger::*;
pub use value_objects::*;
