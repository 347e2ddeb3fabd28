//! Observability support for the link layer

pub mod logging;

pub use logging::{init_default_logging, init_logging, level_for_verbosity, LogFormat};
