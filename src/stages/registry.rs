use std::collections::HashMap;
use std::sync::Arc;

use super::{OrchestratorStage, ReviewStage, Stage, StageKind};

/// Maps stage names to the capability that implements them
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<StageKind, Arc<dyn Stage>>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut registered: Vec<_> = self.stages.keys().collect();
        registered.sort();
        f.debug_struct("StageRegistry")
            .field("registered", &registered)
            .finish()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the engine-owned entry and review stages
    pub fn with_builtins() -> Self {
        Self::new()
            .with(StageKind::ENTRY, OrchestratorStage)
            .with(StageKind::REVIEW, ReviewStage)
    }

    pub fn with<S: Stage + 'static>(mut self, kind: StageKind, stage: S) -> Self {
        self.register(kind, Arc::new(stage));
        self
    }

    /// Register or replace the capability for `kind`
    pub fn register(&mut self, kind: StageKind, stage: Arc<dyn Stage>) -> Option<Arc<dyn Stage>> {
        self.stages.insert(kind, stage)
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn Stage>> {
        self.stages.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.contains_key(&kind)
    }

    /// Stages from the closed set that have no capability yet
    pub fn missing(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|kind| !self.contains(*kind))
            .collect()
    }
}
