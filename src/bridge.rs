//! Recognition request dispatcher.
//!
//! Turns a host method call (`extractText` / `extractHocr`) into exactly one
//! terminal response. Per request the stages run strictly in order:
//! provisioning, argument validation, session open, recognition.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use image::GenericImageView;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::{
    EngineError, ImageInput, LanguageProfile, MarkupEvent, RecognitionEngine, RecognitionSession,
};
use crate::markup;
use crate::provision::{DataLease, ProvisionError, Provisioner};

pub const EXTRACT_TEXT: &str = "extractText";
pub const EXTRACT_HOCR: &str = "extractHocr";

// ============================================================================
// Protocol types
// ============================================================================

/// A call arriving from the host channel.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    PlainText,
    PositionalMarkup,
}

impl OutputMode {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            EXTRACT_TEXT => Some(Self::PlainText),
            EXTRACT_HOCR => Some(Self::PositionalMarkup),
            _ => None,
        }
    }
}

/// A validated request, built per call.
#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    pub image_path: PathBuf,
    pub language: LanguageProfile,
    pub output_mode: OutputMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionOutcome {
    ExtractedText(String),
    ExtractedMarkup(String),
}

impl RecognitionOutcome {
    pub fn into_string(self) -> String {
        match self {
            Self::ExtractedText(s) | Self::ExtractedMarkup(s) => s,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid arguments passed: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Provisioning(#[from] ProvisionError),
    #[error("Could not initialize recognition engine: {0}")]
    EngineInit(EngineError),
    #[error("OCR failed: {0}")]
    RecognitionFailed(String),
    #[error("method '{0}' is not implemented")]
    UnsupportedOperation(String),
}

impl DispatchError {
    /// Code surfaced to the host for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "INVALID_ARGS",
            Self::Provisioning(ProvisionError::DestinationUnavailable(_)) => "DIRECTORY_ERROR",
            Self::Provisioning(_) => "BUNDLE_ERROR",
            Self::EngineInit(_) => "INIT_ERROR",
            Self::RecognitionFailed(_) => "OCR_FAILED",
            Self::UnsupportedOperation(_) => "NOT_IMPLEMENTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Terminal response delivered to the host, once per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MethodResponse {
    Result(String),
    Error(MethodError),
    NotImplemented(String),
}

impl From<DispatchError> for MethodResponse {
    fn from(err: DispatchError) -> Self {
        match err {
            // Not an error response: the host falls back to its own handling.
            DispatchError::UnsupportedOperation(method) => MethodResponse::NotImplemented(method),
            err => {
                let details = match &err {
                    DispatchError::Provisioning(e) => Some(e.to_string()),
                    DispatchError::EngineInit(e) => Some(e.to_string()),
                    DispatchError::RecognitionFailed(d) => Some(d.clone()),
                    _ => None,
                };
                MethodResponse::Error(MethodError {
                    code: err.code().to_string(),
                    message: err.to_string(),
                    details,
                })
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    image_path: String,
    language: String,
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher {
    provisioner: Arc<Provisioner>,
    engine: Arc<dyn RecognitionEngine>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(provisioner: Arc<Provisioner>, engine: Arc<dyn RecognitionEngine>) -> Self {
        Self {
            provisioner,
            engine,
            timeout: None,
        }
    }

    /// Bound the recognition stage. `None` waits for the engine indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Handle one host call. Unknown methods are answered without any
    /// provisioning or engine work.
    pub async fn call(&self, call: MethodCall) -> MethodResponse {
        let Some(mode) = OutputMode::from_method(&call.method) else {
            warn!("Dispatcher: unsupported method '{}'", call.method);
            return DispatchError::UnsupportedOperation(call.method).into();
        };

        match self.handle(mode, &call.arguments).await {
            Ok(outcome) => MethodResponse::Result(outcome.into_string()),
            Err(e) => e.into(),
        }
    }

    /// Provision, validate, open a session and recognize.
    pub async fn handle(
        &self,
        mode: OutputMode,
        arguments: &serde_json::Value,
    ) -> Result<RecognitionOutcome, DispatchError> {
        let span = info_span!("recognition", request_id = %Uuid::new_v4(), mode = ?mode);

        async move {
            let lease = self.provisioner.ensure_provisioned().await?;

            let request = parse_request(mode, arguments)?;
            let image = decode_image(request.image_path.clone()).await?;

            let session = self
                .engine
                .open_session(lease.path(), &request.language)
                .await
                .map_err(|e| {
                    error!(
                        "Dispatcher: {} session for '{}' failed: {}",
                        self.engine.name(),
                        request.language,
                        e
                    );
                    DispatchError::EngineInit(e)
                })?;

            let outcome = self
                .recognize(lease, session.into(), image, request.output_mode)
                .await;

            match &outcome {
                Ok(RecognitionOutcome::ExtractedText(text)) => {
                    info!("Dispatcher: extracted {} chars of text", text.chars().count())
                }
                Ok(RecognitionOutcome::ExtractedMarkup(hocr)) => {
                    info!("Dispatcher: extracted hOCR with {} words", markup::words(hocr).len())
                }
                Err(e) => error!("Dispatcher: {}", e),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Invoke the engine in the requested mode and await its single terminal
    /// result.
    ///
    /// The lease travels with the engine task, so the data directory stays
    /// locked until the engine stops, even if this future is dropped first.
    async fn recognize(
        &self,
        lease: DataLease,
        session: Arc<dyn RecognitionSession>,
        image: ImageInput,
        mode: OutputMode,
    ) -> Result<RecognitionOutcome, DispatchError> {
        let (mut tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            // Released when this task is done with the engine.
            let _lease = lease;
            let result = match mode {
                OutputMode::PlainText => tokio::select! {
                    _ = tx.closed() => {
                        debug!("Dispatcher: request dropped, stopping text recognition");
                        return;
                    }
                    recognized = session.recognize_text(&image) => match recognized {
                        Ok(Some(text)) if !text.trim().is_empty() => Ok(text),
                        Ok(_) => Err("engine returned no text".to_string()),
                        Err(e) => Err(e.to_string()),
                    },
                },
                OutputMode::PositionalMarkup => {
                    let mut events = session.publish_markup(&image);
                    let first = tokio::select! {
                        _ = tx.closed() => None,
                        event = events.recv() => Some(event),
                    };
                    // Release the subscription and wait for the publisher to
                    // let go of it.
                    events.close();
                    while events.recv().await.is_some() {}
                    match first {
                        Some(Some(MarkupEvent::Value(hocr))) => Ok(hocr),
                        Some(Some(MarkupEvent::Failure(details))) => Err(details),
                        Some(None) => Err("markup publisher closed without a result".to_string()),
                        None => {
                            debug!("Dispatcher: request dropped, markup subscription released");
                            return;
                        }
                    }
                }
            };
            let _ = tx.send(result);
        });

        let terminal = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                // Dropping the receiver stops the engine task.
                Err(_) => {
                    return Err(DispatchError::RecognitionFailed(format!(
                        "timed out after {}s",
                        limit.as_secs_f64()
                    )))
                }
            },
            None => rx.await,
        };

        let value = terminal
            .map_err(|_| DispatchError::RecognitionFailed("engine task ended without a result".to_string()))?
            .map_err(DispatchError::RecognitionFailed)?;

        match mode {
            OutputMode::PlainText if markup::is_positional_markup(&value) => Err(
                DispatchError::RecognitionFailed("engine returned markup for a plain-text request".to_string()),
            ),
            OutputMode::PlainText => Ok(RecognitionOutcome::ExtractedText(value)),
            OutputMode::PositionalMarkup if !markup::is_positional_markup(&value) => Err(
                DispatchError::RecognitionFailed("engine output is not positional markup".to_string()),
            ),
            OutputMode::PositionalMarkup => Ok(RecognitionOutcome::ExtractedMarkup(value)),
        }
    }
}

fn parse_request(
    mode: OutputMode,
    arguments: &serde_json::Value,
) -> Result<RecognitionRequest, DispatchError> {
    let payload: Payload = serde_json::from_value(arguments.clone())
        .map_err(|e| DispatchError::InvalidArguments(e.to_string()))?;

    if payload.image_path.trim().is_empty() {
        return Err(DispatchError::InvalidArguments("imagePath is empty".to_string()));
    }
    let language = LanguageProfile::new(payload.language)
        .ok_or_else(|| DispatchError::InvalidArguments("language is empty".to_string()))?;

    Ok(RecognitionRequest {
        image_path: PathBuf::from(payload.image_path),
        language,
        output_mode: mode,
    })
}

/// Decode the image once so unreadable input is rejected before the engine
/// is touched.
async fn decode_image(path: PathBuf) -> Result<ImageInput, DispatchError> {
    let decoded = tokio::task::spawn_blocking(move || {
        let dimensions = image::open(&path).map(|img| img.dimensions());
        (path, dimensions)
    })
    .await
    .map_err(|e| DispatchError::InvalidArguments(format!("image decode task failed: {}", e)))?;

    match decoded {
        (path, Ok((width, height))) => {
            debug!("Dispatcher: decoded {} ({}x{})", path.display(), width, height);
            Ok(ImageInput {
                path,
                width,
                height,
            })
        }
        (path, Err(e)) => Err(DispatchError::InvalidArguments(format!(
            "cannot read image {}: {}",
            path.display(),
            e
        ))),
    }
}
