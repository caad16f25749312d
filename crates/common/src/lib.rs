//! Shared plumbing for the calltrace workspace: logging bootstrap and the
//! alignment helpers every layer of the pipeline ends up needing.

pub mod align;
pub mod logger;

pub use align::{align_down, align_up, is_aligned};
pub use logger::Logger;
