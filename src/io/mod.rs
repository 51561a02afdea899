//! Logging setup and the files a run reads and writes.

pub mod bins;
mod output;
mod summary;

pub use output::setup_output;
pub use summary::{read_summary, write_summary};
