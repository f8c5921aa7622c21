use std::path::PathBuf;

use ort::error::Error as OrtError;

pub type Result<T> = std::result::Result<T, EmbeddingError>;

#[derive(thiserror::Error, Debug)]
pub enum EmbeddingError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode image {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("Tensor shape error: {0}")]
    Shape(String),
    #[error("Invalid path for model files: {0}")]
    InvalidPath(String),
    #[error("Model contract error: {0}")]
    ModelContract(String),
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] OrtError),
    #[error("Inference error: {0}")]
    Inference(String),
}

impl EmbeddingError {
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn shape<S: Into<String>>(msg: S) -> Self {
        Self::Shape(msg.into())
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures raised by the inference runtime itself rather than
    /// by preprocessing or pooling.
    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::Ort(_) | Self::Inference(_))
    }
}

impl From<ndarray::ShapeError> for EmbeddingError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Shape(err.to_string())
    }
}
