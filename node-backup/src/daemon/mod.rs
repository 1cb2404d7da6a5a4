//! Process lifecycle of the long-running agent.

pub mod shutdown;

pub use shutdown::ShutdownCoordinator;
