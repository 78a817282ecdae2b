//! Stage processors for feasibility, planning and execution.

pub mod execution;
pub mod feasibility;
pub mod planning;
pub mod prompts;

use std::sync::Arc;

use super::processor::{StageContext, StageProcessor};

pub use execution::ExecutionProcessor;
pub use feasibility::FeasibilityProcessor;
pub use planning::PlanningProcessor;

/// One processor per stage, sharing a context
pub fn default_processors(ctx: &StageContext) -> Vec<Arc<dyn StageProcessor>> {
    vec![
        Arc::new(FeasibilityProcessor::new(ctx.clone())),
        Arc::new(PlanningProcessor::new(ctx.clone())),
        Arc::new(ExecutionProcessor::new(ctx.clone())),
    ]
}
