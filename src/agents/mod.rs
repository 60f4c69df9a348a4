pub mod attachments;
pub mod estimator;
pub mod traits;

pub use attachments::Attachment;
pub use estimator::EstimatorAgent;
pub use traits::{AgentBehavior, ChatTurnRequest, StreamEvent};
