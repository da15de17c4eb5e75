pub mod logging;
pub mod opentelemetry;
pub mod tokio_console;
