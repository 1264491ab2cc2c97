pub mod process;
pub mod workers;

pub use process::{Params, Process, ProcessPool};
pub use workers::{Task, WorkersPool, DEFAULT_POOL_SIZE};
