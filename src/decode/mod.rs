//! Constrained decoding: the primal-dual loop, candidate selection and the
//! per-example driver.

pub mod cancel;
pub mod driver;
pub mod dual;
pub mod observer;
pub mod record;
pub mod selection;

pub use cancel::CancelFlag;
pub use driver::{Decoder, ExampleOutcome, RunSummary};
pub use dual::{DualOptimization, LengthOutcome, LoopSettings, LoopState, ObjectiveSlot};
pub use observer::{NullObserver, RecordingObserver, StepEvent, StepObserver, TracingObserver};
pub use record::{BestRecord, Candidate, RunningBest};
pub use selection::{
    SelectionCriterion, candidate_for_length, length_window, select_best, should_replace,
};
