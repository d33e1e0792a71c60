pub mod queue;
pub mod semaphore;
