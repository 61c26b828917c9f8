//! Task lifecycle engine for shepherd.
//!
//! Contains the reconciler control loop, the in-memory event log with its
//! streaming protocol, the signed callback dispatcher, the sandbox
//! assignment client, VCS token vending, and the shared terminal-transition
//! pipeline. Persistence lives in `shepherd-store`; HTTP surfaces live in
//! the `shepherd` binary.

pub mod assign;
pub mod callback;
pub mod completion;
pub mod context;
pub mod events;
pub mod leader;
pub mod reconcile;
pub mod recorder;
pub mod token;
