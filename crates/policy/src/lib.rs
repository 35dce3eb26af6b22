//! Policy mediation core: the argument-role registry, the path/URL
//! normalizer, compiled-rule types, and the two-phase policy engine.
//!
//! The engine is constructed once per session from audited JSON artifacts
//! and is immutable afterwards, so it can be shared freely across tasks.

pub mod annotations;
pub mod engine;
pub mod lists;
pub mod normalize;
pub mod request;
pub mod roles;
pub mod rules;
pub mod scenarios;

pub use {
    annotations::{ServerAnnotations, ToolAnnotation, ToolAnnotationsFile},
    engine::{EngineConfig, PolicyEngine},
    lists::{DynamicLists, ListDefinition},
    normalize::{NormalizedArguments, normalize_arguments},
    request::{Decision, PolicyDecision, ToolCallRequest},
    roles::{ArgumentRole, RoleCategory, RoleSpec},
    rules::{
        CompiledPolicy, CompiledRule, Condition, DomainsCondition, ListCondition, ListMatchType,
        PathsCondition,
    },
    scenarios::{ExpectedDecision, ScenarioFile, ScenarioRequest, ScenarioSource, TestScenario},
};

/// The only server whose calls are eligible for the structural
/// sandbox-containment shortcut.
pub const FILESYSTEM_SERVER: &str = "filesystem";
