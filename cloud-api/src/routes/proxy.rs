//! Configuration-provider endpoint polled by the reverse proxy.

use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use cloud_orchestrator::ProxyDocument;
use serde::Deserialize;

pub fn routes() -> Router<AppState> {
    Router::new().route("/proxy/config", get(proxy_config))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    /// Comma separated web entrypoints for HTTP routers.
    pub entrypoints: Option<String>,
}

impl ProxyQuery {
    fn entrypoints(&self) -> Vec<String> {
        self.entrypoints
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect()
    }
}

async fn proxy_config(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
) -> ApiResult<Json<ProxyDocument>> {
    let document = state
        .manager
        .build_proxy_config(&query.entrypoints())
        .await?;
    Ok(Json(document))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entrypoint_list_parsing() {
        let query = ProxyQuery {
            entrypoints: Some("web, websecure,,".to_string()),
        };
        assert_eq!(query.entrypoints(), vec!["web", "websecure"]);
        assert!(ProxyQuery::default().entrypoints().is_empty());
    }
}
