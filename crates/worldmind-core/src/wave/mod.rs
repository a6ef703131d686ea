//! Wave execution: concurrent dispatch and post-dispatch evaluation.

pub mod dispatcher;
pub mod evaluator;

pub use dispatcher::{DispatchedWave, WaveDispatcher};
pub use evaluator::WaveEvaluator;
