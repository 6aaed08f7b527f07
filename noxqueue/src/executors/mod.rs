//! Concrete executors shipped with the queue.

pub mod command;

pub use command::CommandExecutor;
