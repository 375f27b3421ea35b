//! Forked-process supervision.

mod forked;

pub use forked::{
    ForkedProcessSupervisor, ProcessExit, SupervisorError, RECENT_OUTPUT_LINES,
};
