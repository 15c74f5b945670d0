//! Operator dashboard: shared state plus the HTTP JSON API.

pub mod server;
pub mod state;

pub use server::spawn_server;
pub use state::DashboardState;
