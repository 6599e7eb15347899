pub mod branch;
pub mod ids;
pub mod messages;
pub mod retention;

pub use branch::{Branch, BranchTree, TreeError, Violation};
pub use messages::{Message, MessageDraft, Role};
pub use retention::{RetentionDecision, RetentionPolicy};
