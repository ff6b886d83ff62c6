//! Recognition engine abstraction.
//!
//! Defines the [`RecognitionEngine`] trait that opens a [`RecognitionSession`]
//! scoped to a language-data directory and a language profile. Sessions expose
//! two entry points: a single-shot plain-text call and a publisher that emits
//! markup events.

pub mod tesseract;

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::mpsc;

/// Trained language/model identifier, e.g. `eng` or `eng+deu`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile(String);

impl LanguageProfile {
    /// Returns `None` for an empty (or whitespace-only) identifier.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Individual models of a combined profile.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('+').filter(|c| !c.is_empty())
    }
}

/// A component names a model file inside the data directory and nothing
/// else: no separators, no parent references.
pub fn is_model_name(component: &str) -> bool {
    !component.is_empty()
        && !component.contains(['/', '\\'])
        && !component.contains("..")
        && !Path::new(component).is_absolute()
}

impl fmt::Display for LanguageProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An image that has been decoded once and is known to be readable.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported language profile '{0}'")]
    UnsupportedLanguage(String),
    #[error("model file unreadable: {0}")]
    ModelUnreadable(String),
    #[error("{0}")]
    Invocation(String),
}

/// Event emitted by the markup publisher. The first event is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupEvent {
    Value(String),
    Failure(String),
}

#[async_trait::async_trait]
pub trait RecognitionEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn open_session(
        &self,
        data_dir: &Path,
        language: &LanguageProfile,
    ) -> Result<Box<dyn RecognitionSession>, EngineError>;
}

#[async_trait::async_trait]
pub trait RecognitionSession: Send + Sync {
    /// Single-shot recognition. `Ok(None)` means the engine ran but found no text.
    async fn recognize_text(&self, image: &ImageInput) -> Result<Option<String>, EngineError>;

    /// Start hOCR recognition and publish its events. Dropping or closing the
    /// receiver releases the subscription: the publisher stops outstanding
    /// work and drops its sender.
    fn publish_markup(&self, image: &ImageInput) -> mpsc::Receiver<MarkupEvent>;
}
