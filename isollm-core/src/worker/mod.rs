pub mod assignment;
pub mod manager;
pub mod naming;
pub mod ports;
pub mod runtime_cli;

pub use manager::{WorkerManager, WorkerView};
pub use ports::{ContainerRuntime, RunningStatus, WorkerCreateConfig, WorkerInfo};
