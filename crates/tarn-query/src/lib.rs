//! Query evaluation and change-aware result sets.
//!
//! A parsed query arrives as a [`Condition`] tree (the parser itself is an
//! external collaborator). [`Results`] materializes evaluations into
//! versioned views, applies sort/distinct/limit/filter descriptors, and
//! can register with a [`NotifierHub`] for background re-evaluation and
//! ordered diff delivery.

pub mod condition;
pub mod notifier;
pub mod results;

pub use condition::{CmpOp, Condition, StrOp, evaluate};
pub use notifier::{ChangeSet, NotificationCallback, NotificationToken, NotifierHub};
pub use results::{AggregateOp, Descriptor, Entry, Results, ResultsMode, UpdatePolicy};
