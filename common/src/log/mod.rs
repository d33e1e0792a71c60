pub mod log_event;
pub mod tracing_factory;
