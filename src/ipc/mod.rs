mod error;
mod handlers;
mod helpers;
mod rest;
mod router;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};

pub fn open_workspace(state: &mut AppState, path: &std::path::Path) -> anyhow::Result<()> {
    handlers::core::open_workspace(state, path)
}
