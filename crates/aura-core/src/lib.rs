pub mod chat_context;
pub mod intent;
pub mod interpreter;
pub mod normalize;
pub mod phrases;
pub mod planner;
pub mod reminders;
pub mod semantic;

pub use intent::{ActHint, Intent, IntentDecision, IntentRouter};
pub use planner::PlannerError;
pub use semantic::{SemanticDecision, SemanticDecisionError, SemanticMemoryItem};
