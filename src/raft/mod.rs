pub mod rpc;
pub mod server;
pub mod state;
pub mod status;
pub mod storage;
pub mod timer;

pub use server::{RaftMessage, RaftServer};
pub use state::{Command, LogEntry, RaftRole, RaftState};
pub use status::ClusterStatus;
pub use timer::RaftTimings;
