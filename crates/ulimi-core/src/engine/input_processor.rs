//! Multimodal input pre-processing seam.
//!
//! The engine never interprets multimodal payloads; at `AddMessage` time it
//! hands raw token ids plus attachments to an [`InputProcessor`] which
//! expands placeholder tokens and returns embeddings with their ranges.
//! Implementations are looked up through an explicit ordered registry keyed
//! by model architecture name, assembled at startup; first match wins.

use std::sync::Arc;

use crate::engine::sequence::{InputEmbedding, MultiModalInput};
use crate::engine::types::TokenId;
use crate::error::Result;

/// Output of input pre-processing.
#[derive(Debug, Default)]
pub struct ProcessedInput {
    pub token_ids: Vec<TokenId>,
    pub multimodals: Vec<MultiModalInput>,
    pub input_embeddings: Vec<InputEmbedding>,
}

/// Capability interface implemented per model architecture.
pub trait InputProcessor: Send + Sync {
    fn preprocess_input(
        &self,
        token_ids: Vec<TokenId>,
        multimodals: Vec<MultiModalInput>,
    ) -> Result<ProcessedInput>;
}

type Matcher = fn(&str) -> bool;
type Factory = fn() -> Arc<dyn InputProcessor>;

/// Ordered `(matcher, factory)` list; resolution iterates and the first
/// matching entry wins.
#[derive(Default)]
pub struct InputProcessorRegistry {
    entries: Vec<(Matcher, Factory)>,
}

impl InputProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, matcher: Matcher, factory: Factory) -> &mut Self {
        self.entries.push((matcher, factory));
        self
    }

    pub fn resolve(&self, architecture: &str) -> Option<Arc<dyn InputProcessor>> {
        self.entries.iter().find(|(matcher, _)| matcher(architecture)).map(|(_, factory)| factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;

    impl InputProcessor for Passthrough {
        fn preprocess_input(
            &self,
            token_ids: Vec<TokenId>,
            multimodals: Vec<MultiModalInput>,
        ) -> Result<ProcessedInput> {
            Ok(ProcessedInput { token_ids, multimodals, input_embeddings: Vec::new() })
        }
    }

    fn passthrough() -> Arc<dyn InputProcessor> {
        Arc::new(Passthrough)
    }

    #[test]
    fn test_first_match_wins() {
        let mut registry = InputProcessorRegistry::new();
        registry.register(|arch| arch.contains("llava"), passthrough);
        registry.register(|_| true, passthrough);

        assert!(registry.resolve("llava-1.5").is_some());
        assert!(registry.resolve("anything").is_some());

        let empty = InputProcessorRegistry::new();
        assert!(empty.resolve("llava-1.5").is_none());
    }
}
