// models.rs
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::broadcast;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    devices::DeviceEvent,
    effects::{EffectDefinition, EffectRegistry},
    manager::Manager,
};

/// Client to server.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Runs a named write command.
    Command {
        device_id: String,
        name: String,
        #[serde(default)]
        #[schema(value_type = Object)]
        payload: serde_json::Value,
    },
}

/// Server to client.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Accepted {
        device_id: String,
        name: String,
    },
    DeviceEvent {
        device_id: String,
        event: DeviceEvent,
        at: DateTime<Utc>,
    },
    EffectEnded { effect_id: Uuid, name: String },
    Error { message: String, code: u16 },
}

impl WsMessage {
    pub fn device_event(device_id: &str, event: DeviceEvent) -> Self {
        WsMessage::DeviceEvent {
            device_id: device_id.to_string(),
            event,
            at: Utc::now(),
        }
    }
}

/// Library file name or inline definition, plus the zone groups to play on.
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartEffectRequest {
    pub file: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub definition: Option<EffectDefinition>,
    /// Device ids per zone group.
    pub zones: Vec<Vec<String>>,
    #[serde(default)]
    pub looped: bool,
    #[serde(default = "default_restore")]
    pub restore: bool,
}

fn default_restore() -> bool {
    true
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StartEffectResponse {
    pub id: Uuid,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorRate {
    pub op: String,
    pub last_minute: usize,
}

pub struct AppState {
    pub manager: Arc<Manager>,
    pub effects: Arc<EffectRegistry>,
    pub effects_dir: PathBuf,
    pub clients: DashMap<Uuid, broadcast::Sender<WsMessage>>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>, effects: Arc<EffectRegistry>, effects_dir: PathBuf) -> Self {
        Self {
            manager,
            effects,
            effects_dir,
            clients: DashMap::new(),
        }
    }

    /// Fans one message out to every connected client.
    pub fn broadcast(&self, message: WsMessage) {
        for client in self.clients.iter() {
            // A closed client is removed by its own connection task.
            let _ = client.value().send(message.clone());
        }
    }
}
