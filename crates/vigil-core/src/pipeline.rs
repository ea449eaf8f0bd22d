//! Processing pipeline.
//!
//! A pipeline is an ordered list of processors. Each processor guards itself
//! with its own lock coordinator; the pipeline acquires that lock around each
//! stage and always releases it, even when the stage fails.

use crate::notifier::Notifier;
use crate::recognizer::{Recognition, Recognizer, RecognizerError};
use crate::rule::RuleSet;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use vigil_store::{LockCoordinator, LockError, LockKey};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("recognition failed: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("lock: {0}")]
    Lock(#[from] LockError),
}

/// Data flowing between stages.
#[derive(Debug, Clone)]
pub enum PipelineData {
    /// Encoded image bytes (any format the `image` crate can decode).
    Image(Vec<u8>),
    Recognition(Recognition),
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn coordinator(&self) -> &LockCoordinator;

    /// Run the stage. `key` must be the holder key of [`coordinator`](Self::coordinator).
    async fn process(&self, input: PipelineData, key: LockKey) -> Result<PipelineData, PipelineError>;
}

#[derive(Default)]
pub struct Pipeline {
    processors: Vec<Arc<dyn Processor>>,
}

impl Pipeline {
    pub fn new(processors: Vec<Arc<dyn Processor>>) -> Self {
        Self { processors }
    }

    pub fn push(&mut self, processor: Arc<dyn Processor>) {
        self.processors.push(processor);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Feed `input` through every stage in order.
    pub async fn process(&self, input: PipelineData) -> Result<PipelineData, PipelineError> {
        let mut data = input;

        for processor in &self.processors {
            let coordinator = processor.coordinator();
            let key = coordinator.lock().await;
            let output = processor.process(data, key).await;

            match coordinator.unlock(key) {
                Ok(()) => {}
                Err(LockError::WrongKey) => {
                    tracing::debug!(stage = processor.name(), "stage lock was preempted");
                }
                Err(e) => tracing::warn!(stage = processor.name(), error = %e, "stage unlock failed"),
            }

            data = output?;
        }

        Ok(data)
    }
}

/// Recognizes faces in images, then notifies for every rule that fires.
///
/// Recognition results pass through untouched.
pub struct RecognitionProcessor {
    recognizer: Arc<Recognizer>,
    rules: RuleSet,
    notifiers: Vec<Arc<dyn Notifier>>,
    coordinator: LockCoordinator,
}

impl RecognitionProcessor {
    pub fn new(recognizer: Arc<Recognizer>, rules: RuleSet, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            recognizer,
            rules,
            notifiers,
            coordinator: LockCoordinator::default(),
        }
    }

    fn notify(&self, recognition: &Recognition) {
        for (rule, notification) in self.rules.evaluate(recognition) {
            tracing::info!(rule = %rule, level = %notification.level, text = %notification.text, "rule fired");
            for notifier in &self.notifiers {
                if let Err(e) = notifier.send(&notification) {
                    tracing::warn!(rule = %rule, error = %e, "notifier failed");
                }
            }
        }
    }
}

#[async_trait]
impl Processor for RecognitionProcessor {
    fn name(&self) -> &str {
        "recognition"
    }

    fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    async fn process(&self, input: PipelineData, key: LockKey) -> Result<PipelineData, PipelineError> {
        self.coordinator.check(Some(key))?;

        match input {
            PipelineData::Image(bytes) => {
                let recognition = self.recognizer.recognize(&bytes).await?;
                self.notify(&recognition);
                Ok(PipelineData::Recognition(recognition))
            }
            passthrough @ PipelineData::Recognition(_) => Ok(passthrough),
        }
    }
}
