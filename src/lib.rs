// Library interface for the hexsh job engine
// This allows the REPL layer, benchmarks and tests to access internal modules

pub mod config;
pub mod error;
pub mod jobs;
pub mod platform;
pub mod process;
pub mod signal;
pub mod stream;
pub mod terminal;

pub use error::{Error, Result};
pub use jobs::{JobInfo, JobManager};
pub use process::SpawnOptions;
pub use stream::{ChannelIndex, OverflowPolicy, StreamController};
