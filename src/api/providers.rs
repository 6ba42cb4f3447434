//! Provider discovery endpoint
//!
//! Lists the registered backends, their models and the reasoning modes a
//! chat request may ask for.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use super::ApiState;
use crate::providers::prompt::ReasoningModeInfo;
use crate::providers::{ProviderInfo, ReasoningMode};

/// All providers response
#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderInfo>,
    pub default_provider: Option<String>,
    pub reasoning_modes: Vec<ReasoningModeInfo>,
}

/// Build providers routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v2/providers", get(list_providers))
        .with_state(state)
}

/// Get all registered providers
async fn list_providers(State(state): State<Arc<ApiState>>) -> Json<ProvidersResponse> {
    let registry = state.chat.registry();

    Json(ProvidersResponse {
        providers: registry.list_info(),
        default_provider: registry.default_name(),
        reasoning_modes: ReasoningMode::ALL.into_iter().map(ReasoningMode::info).collect(),
    })
}
