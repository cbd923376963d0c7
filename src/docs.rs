use utoipa::OpenApi;

use crate::{commands, devices, effects, handlers, models};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::list_devices,
        handlers::get_device,
        handlers::run_command,
        handlers::error_rates,
        handlers::list_effects,
        handlers::start_effect,
        handlers::stop_effect,
        handlers::effect_library,
    ),
    components(schemas(
        models::WsMessage,
        models::ClientRequest,
        models::StartEffectRequest,
        models::StartEffectResponse,
        models::ErrorRate,
        devices::DeviceSnapshot,
        devices::DeviceEvent,
        effects::RunningEffect,
        commands::SetPower,
        commands::SetColor,
        commands::SetColorHex,
        commands::SetColorMode,
        commands::SetRelay,
        commands::SetInfrared,
        commands::SetHev,
        commands::SetName,
        commands::SetZoneColor,
        commands::SetZoneEffect,
        commands::SetRandomColor,
    ))
)]
pub struct ApiDoc;
