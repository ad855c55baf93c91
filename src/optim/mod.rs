//! # Optimization
//!
//! Parameter updates (AdamW, LAMB), learning rate schedules and dynamic loss scaling. All three
//! expose their state so that a resumed run continues exactly where the checkpoint left off.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use t5_pretrain::optim::{GradScaler, LRScheduler, Optimizer, OptimizerKind, SchedulerKind};
//! use tch::{nn, Device};
//!
//! let vs = nn::VarStore::new(Device::Cpu);
//! let mut optimizer = Optimizer::new(&vs, OptimizerKind::Lamb, 2e-3, 0.1)?;
//! let mut scheduler = LRScheduler::new(SchedulerKind::Cosine, 2e-3, 250_000, 0.004)?;
//! let scaler = GradScaler::new(true);
//! optimizer.set_learning_rate(scheduler.learning_rate());
//! # Ok(())
//! # }
//! ```

mod optimizer;
mod scaler;
mod scheduler;

pub use optimizer::{
    applies_weight_decay, clip_grad_norm, Optimizer, OptimizerKind, OptimizerState, BETAS,
    EPSILON, NO_DECAY_PATTERNS,
};
pub use scaler::{
    GradScaler, GradScalerState, BACKOFF_FACTOR, GROWTH_FACTOR, GROWTH_INTERVAL, INITIAL_SCALE,
};
pub use scheduler::{
    LRScheduler, SchedulerKind, SchedulerState, COSINE_MIN_FACTOR, LINEAR_END_FACTOR,
};
