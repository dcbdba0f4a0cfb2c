//! kctl ops: recreate-update and delete-and-await over any `ResourceGateway`.

#![forbid(unsafe_code)]

mod coordinator;
pub mod locks;
pub mod sweep;
pub mod watch;

pub use coordinator::Coordinator;
pub use locks::{NameGuard, NameLocks};
pub use sweep::Sweeper;
pub use watch::{Confirmation, DeletionWatch, WaitResult};
