//! Stub rules: data model, compiled match predicates, and the in-memory
//! store that serves priority-ordered matching with ephemeral lifecycle.

pub mod predicates;
pub mod store;
pub mod types;

pub use predicates::{CompileError, CompiledRequestMatcher};
pub use store::{ServeOutcome, StoredRule, StubStore};
pub use types::{CreateStubRequest, StubRule};
