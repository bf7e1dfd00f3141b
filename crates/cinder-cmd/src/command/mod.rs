//! # Commands
//!
//! Units of deferred work. Each command owns what it needs to flush and
//! implements the same contract:
//!
//! ```text
//!   submit(task_level, terminated)
//!     terminated ──► previous stamp, device untouched
//!     otherwise  ──► own receiver (device for markers)
//!                    ──► build DispatchFlags
//!                    ──► flush_task
//!                    ──► wait, then post-flush work
//! ```

mod kernel;
mod map_unmap;
mod marker;

pub use kernel::CommandComputeKernel;
pub use map_unmap::{CommandMapUnmap, MapOperationType};
pub use marker::CommandMarker;

use alloc::boxed::Box;

use cinder_core::TaskLevel;

use crate::flags::CompletionStamp;

/// A deferred command
#[derive(Debug)]
pub enum Command {
    /// Kernel dispatch
    ComputeKernel(Box<CommandComputeKernel>),
    /// Buffer map or unmap
    MapUnmap(CommandMapUnmap),
    /// Marker or barrier
    Marker(CommandMarker),
}

impl Command {
    /// Flush the command at `task_level`
    ///
    /// A terminated submit returns the stamp of the last real submission,
    /// or the zero stamp if there was none.
    pub fn submit(&mut self, task_level: TaskLevel, terminated: bool) -> CompletionStamp {
        match self {
            Command::ComputeKernel(command) => command.submit(task_level, terminated),
            Command::MapUnmap(command) => command.submit(task_level, terminated),
            Command::Marker(command) => command.submit(task_level, terminated),
        }
    }

    /// Stamp of the last real submission
    pub fn completion_stamp(&self) -> CompletionStamp {
        match self {
            Command::ComputeKernel(command) => command.completion_stamp(),
            Command::MapUnmap(command) => command.completion_stamp(),
            Command::Marker(command) => command.completion_stamp(),
        }
    }
}

impl From<CommandComputeKernel> for Command {
    fn from(command: CommandComputeKernel) -> Self {
        Command::ComputeKernel(Box::new(command))
    }
}

impl From<CommandMapUnmap> for Command {
    fn from(command: CommandMapUnmap) -> Self {
        Command::MapUnmap(command)
    }
}

impl From<CommandMarker> for Command {
    fn from(command: CommandMarker) -> Self {
        Command::Marker(command)
    }
}

static_assertions::assert_impl_all!(Command: Send);
