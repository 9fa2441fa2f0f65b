//! Guest side of the guest control service: sessions, supervised child
//! processes and the loop that serves host requests.

pub mod cancel;
pub mod control;
pub(crate) mod process;
pub mod scratch;
pub mod service;
pub mod session;
pub mod session_thread;
pub mod sys;

pub use cancel::CancelToken;
pub use control::{ControlConfig, ControlService, HostMessagePump, ServiceContext};
pub use scratch::ScratchBuffer;
pub use service::{Harness, InitOutcome, Running, StartSignal, Subservice};
pub use session::spawned::{SessionExit, SpawnedSession};
pub use session::{Flow, GuestSession, SessionOptions};
pub use session_thread::{SessionThread, SessionThreadConfig};
