pub mod router;
pub mod session;

pub use router::{RouteOutcome, SessionRouter};
pub use session::{ConversationSession, EndReason, SessionEnd};
