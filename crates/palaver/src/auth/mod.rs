//! Authentication middleware.
//!
//! Sessions are issued elsewhere; this layer only validates the bearer
//! token it is handed and injects the principal id into the request. The
//! token may arrive as an `Authorization` header, an `auth_token` cookie,
//! or a `token` query parameter; the query form exists because browser
//! WebSocket clients cannot set headers on the upgrade request.

mod error;
mod middleware;

pub use error::AuthError;
pub use middleware::{AuthState, Claims, Principal, auth_middleware};
