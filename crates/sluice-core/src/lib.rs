pub mod config;
pub mod data;
pub mod error;
pub mod event;
pub mod resolver;
pub mod traits;
pub mod types;
pub mod validation;
pub mod workflow;

pub use config::AppConfig;
pub use data::SessionDataStore;
pub use error::{Result, SluiceError};
pub use event::{EventBus, SessionEvents};
pub use resolver::VariableResolver;
pub use types::*;
pub use validation::{validate, ValidationReport};
pub use workflow::{NodeConfig, NodeType, Workflow, WorkflowEdge, WorkflowNode};
