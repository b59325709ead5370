mod bridge;
mod context;
mod registry;
mod runner;
mod skills;
mod validate;

pub use bridge::{DesktopBridge, NoopBridge};
pub use context::SkillContext;
pub use registry::{Skill, SkillManifest, SkillRegistry};
pub use runner::SkillRunner;
pub use validate::{validate_inputs, InputValidationError};
