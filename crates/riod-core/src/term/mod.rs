//! Terminal subsystem: PTY sessions reified as file trees.

pub mod ansi;
pub mod files;
pub mod session;

pub use ansi::{strip_ansi, AnsiStripper};
pub use files::TermsDir;
pub use session::{parse_agent_registration, TermEvent, TermSession};
