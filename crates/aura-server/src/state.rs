use std::path::PathBuf;
use std::sync::Arc;

use aura_brain::{BrainConfig, BrainRouter, Secrets};
use aura_runtime::{ReminderScheduler, RunEngine};
use aura_skills::{DesktopBridge, NoopBridge, SkillRegistry};
use aura_store::{EventBus, Store};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub brain: Arc<BrainRouter>,
    pub engine: Arc<RunEngine>,
    pub scheduler: Arc<ReminderScheduler>,
    pub secrets: Arc<Secrets>,
    pub base_dir: PathBuf,
    pub qa_mode: bool,
}

impl AppState {
    /// Wires the service around an explicit brain (tests inject stub
    /// providers through it).
    pub fn with_brain(
        store: Arc<Store>,
        brain: Arc<aura_brain::BrainRouter>,
        secrets: Arc<Secrets>,
        base_dir: PathBuf,
        qa_mode: bool,
    ) -> Self {
        let bridge: Arc<dyn DesktopBridge> = Arc::new(NoopBridge);
        let registry = Arc::new(SkillRegistry::builtin());
        let engine = Arc::new(RunEngine::new(
            store.clone(),
            brain.clone(),
            registry,
            bridge,
            base_dir.clone(),
        ));
        let scheduler = Arc::new(ReminderScheduler::new(store.clone()));
        let bus = EventBus::new(store.clone());
        Self {
            store,
            bus,
            brain,
            engine,
            scheduler,
            secrets,
            base_dir,
            qa_mode,
        }
    }

    /// Wires the whole service from environment configuration. Call once
    /// at startup; the reminder scheduler starts separately.
    pub fn from_env(store: Arc<Store>) -> Self {
        let secrets = Arc::new(Secrets::new());
        let config = BrainConfig::from_env(&secrets);
        let qa_mode = config.qa_mode;
        let base_dir =
            PathBuf::from(std::env::var("AURA_BASE_DIR").unwrap_or_else(|_| ".".to_string()));
        let brain = Arc::new(BrainRouter::new(config, store.clone(), secrets.clone()));
        Self::with_brain(store, brain, secrets, base_dir, qa_mode)
    }
}
