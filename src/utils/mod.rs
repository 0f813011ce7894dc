// Utility modules shared across services and the pipeline

pub mod common;
pub mod logger;
pub mod retry;
