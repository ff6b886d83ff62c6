//! Tesseract engine driven through the `tesseract` command-line tool.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    is_model_name, EngineError, ImageInput, LanguageProfile, MarkupEvent, RecognitionEngine, RecognitionSession,
};

pub struct TesseractEngine {
    binary: PathBuf,
}

impl TesseractEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait::async_trait]
impl RecognitionEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn open_session(
        &self,
        data_dir: &Path,
        language: &LanguageProfile,
    ) -> Result<Box<dyn RecognitionSession>, EngineError> {
        for component in language.components() {
            if !is_model_name(component) {
                return Err(EngineError::UnsupportedLanguage(component.to_string()));
            }
            let model = data_dir.join(format!("{}.traineddata", component));
            match tokio::fs::metadata(&model).await {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => {
                    return Err(EngineError::ModelUnreadable(format!(
                        "{} is not a file",
                        model.display()
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(EngineError::UnsupportedLanguage(component.to_string()))
                }
                Err(e) => {
                    return Err(EngineError::ModelUnreadable(format!(
                        "{}: {}",
                        model.display(),
                        e
                    )))
                }
            }
        }

        debug!(
            "TesseractEngine: session for '{}' in {}",
            language,
            data_dir.display()
        );

        Ok(Box::new(TesseractSession {
            binary: self.binary.clone(),
            data_dir: data_dir.to_path_buf(),
            language: language.clone(),
        }))
    }
}

struct TesseractSession {
    binary: PathBuf,
    data_dir: PathBuf,
    language: LanguageProfile,
}

impl TesseractSession {
    /// `tesseract <image> stdout --tessdata-dir <dir> -l <lang> [config]`
    fn command(&self, image: &ImageInput, config: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(&image.path)
            .arg("stdout")
            .arg("--tessdata-dir")
            .arg(&self.data_dir)
            .arg("-l")
            .arg(self.language.as_str());
        if let Some(config) = config {
            cmd.arg(config);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl RecognitionSession for TesseractSession {
    async fn recognize_text(&self, image: &ImageInput) -> Result<Option<String>, EngineError> {
        info!(
            "TesseractEngine: recognizing {} ({}x{})",
            image.path.display(),
            image.width,
            image.height
        );
        let text = run(self.command(image, None)).await?;
        let text = text.trim();
        Ok(if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        })
    }

    fn publish_markup(&self, image: &ImageInput) -> mpsc::Receiver<MarkupEvent> {
        info!(
            "TesseractEngine: recognizing {} as hOCR ({}x{})",
            image.path.display(),
            image.width,
            image.height
        );
        let (tx, rx) = mpsc::channel(1);
        let cmd = self.command(image, Some("hocr"));

        tokio::spawn(async move {
            let event = tokio::select! {
                _ = tx.closed() => {
                    debug!("TesseractEngine: hOCR subscriber released before completion");
                    return;
                }
                result = run(cmd) => match result {
                    Ok(markup) => MarkupEvent::Value(markup),
                    Err(e) => MarkupEvent::Failure(e.to_string()),
                },
            };
            let _ = tx.send(event).await;
        });

        rx
    }
}

async fn run(mut cmd: Command) -> Result<String, EngineError> {
    let output = cmd
        .output()
        .await
        .map_err(|e| EngineError::Invocation(format!("failed to execute tesseract: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::Invocation(format!(
            "tesseract exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| EngineError::Invocation(format!("invalid UTF-8 output: {}", e)))
}
