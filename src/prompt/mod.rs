pub mod assembler;
pub mod budget;
pub mod classify;
pub mod directives;
pub mod profile;
pub mod stage;

pub use assembler::{AssembledPrompt, KnowledgeFragment, PromptAssembler, PromptRequest};
pub use budget::PromptLimits;
pub use classify::{BuildingType, DeliveryMethod, ProjectSignals, PublicWorksKind};
pub use profile::CompanyProfile;
pub use stage::{ConversationTurn, Role};
