//! Locks: the table, fencing tokens, replicated commands and the
//! client-facing service.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod command;
mod fencing;
mod model;
mod service;
mod state_machine;
mod store;

pub use command::{CommandOutput, LockCommand, LockRaftHandle};
pub(crate) use command::propose;
pub use fencing::FencingTokenGenerator;
pub use model::{
    now_millis, FencingToken, Lock, LockError, LockInfo, LockResult, LockResultExt, LockStatus,
};
pub use service::LockService;
pub use state_machine::LockStateMachine;
pub use store::LockStore;
