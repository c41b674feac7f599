//! Core traits for the FireFlow system
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`AddressSource`]: Discover the current public address
//! - [`FirewallProvider`]: Manage remote firewall rules via a vendor API
//! - [`RuleRepository`]: Storage for rules and credential records
//! - [`ConfigSource`]: Runtime key/value settings

pub mod address_source;
pub mod config_source;
pub mod firewall_provider;
pub mod rule_repository;

pub use address_source::{AddressSource, validate_address};
pub use config_source::ConfigSource;
pub use firewall_provider::{
    FirewallProvider, FirewallProviderFactory, Replacement, bounded, replace_rule,
};
pub use rule_repository::RuleRepository;
