pub mod app;
pub mod cli;
pub mod shutdown;
pub mod telemetry;
