//! Optimizer and learning-rate schedule.

pub mod adamw;
pub mod schedule;

pub use adamw::{AdamW, AdamWState, TensorState};
pub use schedule::{LearningRateFn, ScheduleSpec};
