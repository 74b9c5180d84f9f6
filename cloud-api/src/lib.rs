pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_app;
pub use state::AppState;
