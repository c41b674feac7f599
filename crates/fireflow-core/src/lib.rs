// # fireflow-core
//
// Core library for keeping cloud-firewall allow-rules in step with the
// operator's current public IPv4 address.
//
// ## Architecture Overview
//
// - **AddressSource**: Trait for discovering the current public address
// - **FirewallProvider**: Trait for managing remote firewall rules via a vendor API
// - **RuleRepository** / **ConfigSource**: Storage boundaries for rules and runtime settings
// - **ReconciliationEngine**: Drives every enabled rule to its desired remote state
// - **PassScheduler**: Owns the single recurring trigger for full passes
// - **ProviderRegistry**: Maps provider names to client factories
// - **AdminService**: The boundary an administrative front end calls into
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Core logic is separate from vendor and transport code
// 2. **Plugin-Based**: Providers are registered by name, built per call from credentials
// 3. **Single Flight**: Passes never overlap
// 4. **Library-First**: All core functionality can be used as a library
// 5. **Idempotency**: Re-running a pass without an address change mutates nothing

pub mod admin;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod traits;

// Re-export core types for convenience
pub use admin::{AdminService, RunSummary};
pub use config::FireflowConfig;
pub use engine::{EngineEvent, PassReport, ReconciliationEngine, RuleOutcome, RuleState};
pub use error::{Error, Result};
pub use identity::{HandleMatcher, LabelMatcher, RuleMatcher};
pub use model::{
    CloudCredentials, DesiredRule, InstanceInfo, ObservedRule, Protocol, RemoteHandle, Rule,
    RuleAction,
};
pub use registry::ProviderRegistry;
pub use scheduler::{EnginePassTask, PassScheduler, ScheduledTask};
pub use store::{FileRuleRepository, MemoryConfigSource, MemoryRuleRepository};
pub use traits::{AddressSource, ConfigSource, FirewallProvider, FirewallProviderFactory, RuleRepository};
