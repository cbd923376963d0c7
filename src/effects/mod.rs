// effects/mod.rs
//! Timed colour choreographies over groups of lights.

pub mod definition;
pub mod library;
mod player;

pub use definition::EffectDefinition;
pub use player::{Effect, EffectEvent, PlayOptions, STOP_GRACE, Schedule};

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{devices::Light, error::AppError, events::EventBus};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EffectNotice {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RunningEffect {
    pub id: Uuid,
    pub name: String,
    pub looped: bool,
}

/// Effects currently playing, keyed by run id. Entries leave once `Ended`
/// has fired.
#[derive(Default)]
pub struct EffectRegistry {
    running: DashMap<Uuid, Arc<Effect>>,
    ended: EventBus<EffectNotice>,
}

impl EffectRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn start(
        self: &Arc<Self>,
        definition: EffectDefinition,
        zones: Vec<Vec<Arc<Light>>>,
        options: PlayOptions,
    ) -> Result<Uuid, AppError> {
        if definition.choreo.is_empty() {
            return Err(AppError::Validation(format!("effect {} has no steps", definition.name)));
        }
        let effect = Arc::new(Effect::new(definition, zones, options)?);
        let id = Uuid::new_v4();
        let mut ended = effect.subscribe();
        self.running.insert(id, Arc::clone(&effect));
        if !effect.start() {
            self.running.remove(&id);
            return Err(AppError::Validation(format!("effect {} did not start", effect.name())));
        }

        let registry = Arc::downgrade(self);
        let name = effect.name().to_string();
        tokio::spawn(async move {
            // A lagged receiver still means the run is over.
            let _ = ended.recv().await;
            if let Some(registry) = registry.upgrade() {
                registry.running.remove(&id);
                registry.ended.publish(EffectNotice { id, name });
            }
        });
        info!(%id, "Effect run registered");
        Ok(id)
    }

    pub fn stop(&self, id: Uuid) -> Result<(), AppError> {
        let effect = self.get(id).ok_or(AppError::EffectNotFound)?;
        effect.stop();
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Effect>> {
        self.running.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn list(&self) -> Vec<RunningEffect> {
        self.running
            .iter()
            .map(|entry| RunningEffect {
                id: *entry.key(),
                name: entry.value().name().to_string(),
                looped: entry.value().looped(),
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EffectNotice> {
        self.ended.subscribe()
    }
}
