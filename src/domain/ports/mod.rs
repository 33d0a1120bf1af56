//! Ports: contracts the core consumes from its collaborators.

pub mod metadata_store;
pub mod signal_dispatcher;
pub mod state_repository;
pub mod template_engine;

pub use metadata_store::{MetadataStore, MetadataStoreExt};
pub use signal_dispatcher::SignalDispatcher;
pub use state_repository::{StateRepository, StateTransaction};
pub use template_engine::{is_truthy, TemplateEngine, VariableMap};
