//! Process supervision for the helper and backend
//!
//! - `process`: what to launch and the lifecycle states
//! - `readiness`: stdout port lines and announcements
//! - `manager`: the [`Supervisor`] itself

pub mod manager;
pub mod process;
pub mod readiness;

pub use manager::{Supervisor, SupervisorConfig};
pub use process::{ProcessInfo, ProcessSpec, ProcessState, ReadinessMode, RestartPolicy};
pub use readiness::{AnnouncementBus, AnnouncementListener, announce, parse_port_line};
