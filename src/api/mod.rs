//! HTTP surface: ingress, federation, and admin routes.

pub mod routes;

pub use routes::{build_router, AppState};
