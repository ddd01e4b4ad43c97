//! Request instrumentation

pub mod metrics_middleware;

pub use metrics_middleware::metrics_layer;
