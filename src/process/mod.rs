pub mod console;
pub mod stats;
pub mod supervisor;

pub use stats::ProcessProbe;
pub use supervisor::{ProcessStatus, ServerProcess};
