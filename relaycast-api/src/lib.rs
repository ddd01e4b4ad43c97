// Relaycast API Library
//
// HTTP ingress for the relay: submissions, listener upgrades, health and metrics

pub mod http;
pub mod observability;

// Re-export commonly used types
pub use http::{create_router, AppState};
