//! Server-side session state and account maintenance.

pub mod context;
pub mod housekeeping;
pub mod resolve;
pub mod session;

pub use context::{Phase, StoreContext};
pub use housekeeping::run_housekeeping;
pub use resolve::{materialize, resolve_block, ResolveError};
