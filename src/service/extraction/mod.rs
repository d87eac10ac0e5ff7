//! Extraction plane: cleaning, classification, schema extraction,
//! validation, chunk merging, the dual-write pipeline and orphan recovery.

pub mod boilerplate;
pub mod content_cleaner;
pub mod orchestrator;
pub mod page_classifier;
pub mod pipeline;
pub mod recovery;
pub mod schema_extractor;
pub mod schema_validator;

pub use boilerplate::{analyze_domain, strip_boilerplate, BoilerplateConfig};
pub use content_cleaner::{clean_for_embedding, strip_structural_junk};
pub use orchestrator::{ExtractionOrchestrator, OrchestratorConfig};
pub use page_classifier::{ClassificationConfig, PageClassifier};
pub use pipeline::{ExtractionPipeline, PipelineConfig};
pub use recovery::EmbeddingRecoveryService;
pub use schema_extractor::{SchemaExtractor, SchemaExtractorConfig};
pub use schema_validator::SchemaValidator;
