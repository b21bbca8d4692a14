use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::config_store::{set_path, Layer, SettingsStore};
use crate::db::deployments;
use crate::error::{ApiError, ApiErrorExt, ErrorKind};
use crate::state::AppState;

/// Merged configuration with every sensitive value masked.
pub async fn get_config(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let masked = state
        .store
        .merged_masked()
        .api_err(ErrorKind::Internal, "Failed to load configuration")?;
    Ok(Json(masked))
}

/// Patch the configuration. Masked values are filtered out so a client
/// echoing a masked read-back cannot clobber the stored secret; each
/// remaining key routes to its layer by the secret classifier.
pub async fn update_config(
    State(state): State<AppState>,
    Json(updates): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filtered = SettingsStore::filter_masked(&updates);
    if filtered.as_object().map(|m| m.is_empty()).unwrap_or(true) {
        return Ok(Json(json!({ "success": true, "message": "No updates to apply" })));
    }
    state
        .store
        .update(&filtered)
        .api_err(ErrorKind::Internal, "Failed to update configuration")?;
    Ok(Json(json!({ "success": true, "message": "Configuration updated" })))
}

/// Capability and missing-key snapshot across all installed services.
pub async fn get_requirements(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut service_ids: Vec<String> = state
        .registry
        .all_services()
        .iter()
        .filter(|s| !s.infrastructure)
        .map(|s| s.id.clone())
        .collect();

    // Services that are actually deployed take priority in the listing,
    // but requirements cover everything installed.
    let active = deployments::list(&state.db).await?;
    service_ids.sort_by_key(|id| {
        !active
            .iter()
            .any(|d| &d.service_id == id)
    });

    let requirements = state.resolver.resolve(&service_ids);

    let service_infos: Vec<serde_json::Value> = requirements
        .services
        .iter()
        .filter_map(|id| state.registry.get(id))
        .map(|service| {
            json!({
                "name": service.service_name,
                "display_name": service.display_name.clone().unwrap_or_else(|| service.service_name.clone()),
                "description": service.description,
            })
        })
        .collect();

    Ok(Json(json!({
        "required_capabilities": requirements.required_capabilities,
        "services": service_infos,
        "all_configured": requirements.all_configured,
        "implied_infrastructure": requirements.implied_infrastructure,
    })))
}

/// Bulk save of configuration keys from the requirements screen. Keys
/// are dot-paths; everything saved here is operator-entered credential
/// material, so it lands in the secrets layer.
pub async fn save_requirements(
    State(state): State<AppState>,
    Json(key_values): Json<BTreeMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut patch = serde_json::Value::Object(serde_json::Map::new());
    let mut saved = 0usize;
    for (key, value) in &key_values {
        let value = value.trim();
        if value.is_empty() || crate::config_store::is_masked(value) {
            continue;
        }
        set_path(&mut patch, key, json!(value));
        saved += 1;
    }

    if saved == 0 {
        return Ok(Json(json!({
            "success": true,
            "message": "No values to save",
            "keys_saved": 0,
        })));
    }

    state
        .store
        .update_layer(&patch, Layer::Secrets)
        .api_err(ErrorKind::Internal, "Failed to save configuration keys")?;

    Ok(Json(json!({
        "success": true,
        "message": "Configuration saved",
        "keys_saved": saved,
    })))
}

/// Clear caches and reload the registry and the configuration store.
/// On a malformed layer file the previous cache stays live and the
/// error is reported.
pub async fn refresh(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .reload()
        .api_err(ErrorKind::Internal, "Configuration reload failed")?;
    state
        .registry
        .reload()
        .api_err(ErrorKind::Internal, "Registry reload failed")?;

    Ok(Json(json!({
        "success": true,
        "message": "Configuration refreshed",
        "services": state.registry.service_count(),
        "providers": state.registry.provider_count(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub include_secrets: bool,
}

/// Delete the overrides layer (and optionally secrets), returning to
/// shipped defaults.
pub async fn reset(
    State(state): State<AppState>,
    body: Option<Json<ResetRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let deleted = state
        .store
        .reset(request.include_secrets)
        .api_err(ErrorKind::Internal, "Failed to reset configuration")?;
    Ok(Json(json!({
        "success": true,
        "message": "Settings reset to defaults",
        "deleted": deleted,
    })))
}
