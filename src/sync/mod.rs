//! Optimistic mutations, retry, reconciliation with the server and collaborative
//! edit protection.

mod executor;
mod guard;
mod listener;
mod mutation;
mod retry;
mod session;

pub use executor::{MutationContext, MutationExecutor};
pub use guard::{ConflictGuard, NoteFields, RemoteOutcome};
pub use listener::{
    EventSourceConnector, PushConnection, PushConnector, PushHandlers, ReconciliationListener,
};
pub use mutation::{Mutation, OptimisticPlan};
pub use retry::{run_with_retry, with_timeout, RetryPolicy};
pub use session::CollabSession;
