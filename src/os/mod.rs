//! The fabricated operating system
//!
//! Everything an attacker sees after login lives here: the in-memory
//! filesystem, the per-session environment, the command table, the line
//! editing terminal and the shell loop that ties them together.

pub mod command;
pub mod context;
pub mod fs;
pub mod shell;
pub mod terminal;

pub use command::{Command, CommandTable, ExecContext};
pub use context::{ContextHandle, ContextSlot, Identity, TermSize, VirtualContext};
pub use fs::{MemoryFs, VirtualFs};
pub use shell::{interpret, LineOutcome, ProcessDelay, Shell};
pub use terminal::Terminal;
