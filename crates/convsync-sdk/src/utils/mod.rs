pub mod tasks;
pub mod timer_registry;

pub use tasks::BackgroundTasks;
pub use timer_registry::TimerRegistry;
