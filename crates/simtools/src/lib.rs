//! Standard tool library
//!
//! Built-in tools for the local worker pool: containers, shell scripts and
//! a couple of helpers for rehearsing workflows.

mod container;
mod debug;
mod process;
mod shell;
mod time;

pub use container::ContainerTool;
pub use debug::EchoTool;
pub use process::{run_process, split_command, ProcessOutput, OOM_EXIT_CODE};
pub use shell::ShellTool;
pub use time::SleepTool;
use simruntime::ToolRegistry;

use std::sync::Arc;

/// Register all standard tools with a registry
pub fn register_all(registry: &mut ToolRegistry) {
    registry.register(Arc::new(ContainerTool::new()));
    registry.register(Arc::new(ShellTool::new()));
    registry.register(Arc::new(SleepTool));
    registry.register(Arc::new(EchoTool));
}
