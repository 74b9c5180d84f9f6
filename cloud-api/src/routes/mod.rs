pub mod health;
pub mod proxy;
pub mod requests;

use crate::state::AppState;
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(proxy::routes())
        .merge(requests::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
