//! Offline-first sync engine
//!
//! Clients record edits while offline and later push them as a batch of
//! deltas, each naming the entity version it was based on. The server
//! applies a delta only if that base version is still current, bumping the
//! entity's version by one. Otherwise the delta is kept as a conflict with
//! both payloads for a later resolution.
//!
//! ## Push
//!
//! Deltas within a batch are independent: a batch ends `completed` (all
//! applied), `partial_conflict` (some applied) or `failed` (none applied).
//! A batch where every delta conflicted is also `failed`, so the status
//! alone does not tell a client whether to retry.
//!
//! ## Pull
//!
//! A device pulls entities changed since a cursor, excluding the ones it
//! last wrote itself. The next cursor comes from the server, never from
//! the client clock.
//!
//! ## Resolve
//!
//! Each conflict is resolved exactly once as `client_wins`, `server_wins`
//! or `manual_merge`. Writing resolutions advance the entity past whatever
//! version is current at resolution time.

mod batch;
mod clock;
mod engine;
mod error;
mod events;
mod feed;
mod ledger;
mod processor;
mod resolver;
mod scheduler;
mod types;
mod validation;
mod version_store;

pub use batch::*;
pub use clock::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use feed::*;
pub use ledger::*;
pub use processor::*;
pub use resolver::*;
pub use scheduler::*;
pub use types::*;
pub use validation::*;
pub use version_store::*;
