//! HTTP surface: router, shared state, and error responses.

mod error;
mod routes;
mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
