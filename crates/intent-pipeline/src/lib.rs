//! Multi-tenant intent resolution for factory management queries.
//!
//! [`IntentPipeline`] turns a user's natural-language request into one of
//! four outcomes: a resolved (and possibly executed) intent, a clarification
//! request, a multi-round conversation, or a preview token that must be
//! confirmed before any write happens.

pub mod calibrator;
pub mod catalog;
pub mod clarification;
pub mod classifier;
pub mod clients;
pub mod config;
pub mod conversation;
pub mod coreference;
pub mod error;
pub mod ladder;
pub mod learning;
pub mod maintenance;
pub mod mock;
pub mod normalizer;
pub mod pipeline;
pub mod preview;
pub mod services;
pub mod tool_router;

pub use catalog::{InMemoryCatalog, IntentCatalog};
pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use maintenance::MaintenanceTask;
pub use pipeline::{ClarificationPrompt, IntentPipeline, Resolution, ResolvedIntent, Services, Stores};
pub use services::{BusinessExecutor, ClassifierService, EmbeddingService, LlmService, ServiceError};
pub use tool_router::{ToolDescriptor, ToolRegistry};
