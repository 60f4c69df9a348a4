pub mod context;
pub mod extract;
pub mod reader;
pub mod registry;
pub mod resolve;

pub use context::{KnowledgeConfig, KnowledgeContext, SharedKnowledge};
pub use reader::KnowledgeReader;
pub use registry::{Registry, RegistryLoader, RegistryNode};
pub use resolve::PathResolver;
