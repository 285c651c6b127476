pub mod config;
pub mod error;
pub mod git_hub;
pub mod multiplexer;
pub mod process;
pub mod queue;
pub mod session;
pub mod worker;
