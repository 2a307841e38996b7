//! Processing chains
//!
//! A chain is an ordered set of SIP processing steps:
//!
//! ```text
//! Init → Preprocessing? → Validation → Generation → Tagging? → Postprocessing? → Final
//! ```
//!
//! Validation and generation are mandatory, the others optional. Steps
//! report failure through [`StepResult`]; the runner turns a failure into an
//! ERROR request for that SIP only and moves on to the next SIP of the batch.
//!
//! Chains are registered statically by name in a [`ChainRegistry`]; ingest
//! metadata selects one by that name.

pub mod runner;
pub mod steps;

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{AipDraft, IngestMetadata, SipDescriptor};

pub use runner::ChainRunner;
pub use steps::{DefaultSingleAipGeneration, DefaultSipValidation};

/// Name of the chain registered by [`ChainRegistry::with_defaults`]
pub const DEFAULT_CHAIN: &str = "DefaultProcessingChain";

// ============================================================================
// Step contracts
// ============================================================================

/// Reasons a step refused a SIP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub reasons: Vec<String>,
}

impl StepFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reasons: vec![reason.into()],
        }
    }

    pub fn with_reasons(reasons: Vec<String>) -> Self {
        Self { reasons }
    }

    pub fn message(&self) -> String {
        self.reasons.join("; ")
    }
}

pub type StepResult<T> = Result<T, StepFailure>;

/// May rewrite the submitted SIP before validation
#[async_trait::async_trait]
pub trait PreprocessingStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn preprocess(&self, sip: SipDescriptor) -> StepResult<SipDescriptor>;
}

#[async_trait::async_trait]
pub trait ValidationStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn validate(&self, sip: &SipDescriptor) -> StepResult<()>;
}

/// Produces one or more AIP drafts from a valid SIP
#[async_trait::async_trait]
pub trait GenerationStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(
        &self,
        sip: &SipDescriptor,
        metadata: &IngestMetadata,
    ) -> StepResult<Vec<AipDraft>>;
}

#[async_trait::async_trait]
pub trait TaggingStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn tag(&self, aips: Vec<AipDraft>) -> StepResult<Vec<AipDraft>>;
}

#[async_trait::async_trait]
pub trait PostprocessingStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn postprocess(&self, sip: &SipDescriptor, aips: &[AipDraft]) -> StepResult<()>;
}

// ============================================================================
// Chains and registry
// ============================================================================

#[derive(Clone)]
pub struct ProcessingChain {
    pub name: String,
    pub preprocessing: Option<Arc<dyn PreprocessingStep>>,
    pub validation: Arc<dyn ValidationStep>,
    pub generation: Arc<dyn GenerationStep>,
    pub tagging: Option<Arc<dyn TaggingStep>>,
    pub postprocessing: Option<Arc<dyn PostprocessingStep>>,
}

impl ProcessingChain {
    pub fn new(
        name: impl Into<String>,
        validation: Arc<dyn ValidationStep>,
        generation: Arc<dyn GenerationStep>,
    ) -> Self {
        Self {
            name: name.into(),
            preprocessing: None,
            validation,
            generation,
            tagging: None,
            postprocessing: None,
        }
    }

    pub fn with_preprocessing(mut self, step: Arc<dyn PreprocessingStep>) -> Self {
        self.preprocessing = Some(step);
        self
    }

    pub fn with_tagging(mut self, step: Arc<dyn TaggingStep>) -> Self {
        self.tagging = Some(step);
        self
    }

    pub fn with_postprocessing(mut self, step: Arc<dyn PostprocessingStep>) -> Self {
        self.postprocessing = Some(step);
        self
    }
}

impl std::fmt::Debug for ProcessingChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingChain")
            .field("name", &self.name)
            .field("preprocessing", &self.preprocessing.as_ref().map(|s| s.name()))
            .field("validation", &self.validation.name())
            .field("generation", &self.generation.name())
            .field("tagging", &self.tagging.as_ref().map(|s| s.name()))
            .field("postprocessing", &self.postprocessing.as_ref().map(|s| s.name()))
            .finish()
    }
}

/// Chains by name
#[derive(Debug, Default)]
pub struct ChainRegistry {
    chains: HashMap<String, Arc<ProcessingChain>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the default single-AIP chain
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ProcessingChain::new(
            DEFAULT_CHAIN,
            Arc::new(DefaultSipValidation),
            Arc::new(DefaultSingleAipGeneration),
        ));
        registry
    }

    /// Add or replace a chain
    pub fn register(&mut self, chain: ProcessingChain) {
        self.chains.insert(chain.name.clone(), Arc::new(chain));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProcessingChain>> {
        self.chains.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.chains.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reject;

    #[async_trait::async_trait]
    impl ValidationStep for Reject {
        fn name(&self) -> &'static str {
            "Reject"
        }

        async fn validate(&self, _sip: &SipDescriptor) -> StepResult<()> {
            Err(StepFailure::new("always"))
        }
    }

    #[test]
    fn test_defaults_registered() {
        let registry = ChainRegistry::with_defaults();
        assert!(registry.contains(DEFAULT_CHAIN));
        assert!(!registry.contains("Missing"));

        let chain = registry.get(DEFAULT_CHAIN).unwrap();
        assert_eq!(chain.validation.name(), "DefaultSipValidation");
        assert!(chain.preprocessing.is_none());
    }

    #[test]
    fn test_register_replaces_by_name() {
        let mut registry = ChainRegistry::with_defaults();
        registry.register(ProcessingChain::new(
            DEFAULT_CHAIN,
            Arc::new(Reject),
            Arc::new(DefaultSingleAipGeneration),
        ));
        registry.register(ProcessingChain::new(
            "Strict",
            Arc::new(Reject),
            Arc::new(DefaultSingleAipGeneration),
        ));

        assert_eq!(registry.names(), vec!["DefaultProcessingChain", "Strict"]);
        assert_eq!(registry.get(DEFAULT_CHAIN).unwrap().validation.name(), "Reject");
    }

    #[test]
    fn test_failure_message_joins_reasons() {
        let failure = StepFailure::with_reasons(vec!["a".into(), "b".into()]);
        assert_eq!(failure.message(), "a; b");
    }
}
