//! Image embedding extraction with a MobileNetV2 ONNX model.
//!
//! The pipeline decodes an image, preprocesses it according to a HuggingFace
//! style [`ProcessorConfig`], runs it through an inference backend and pools
//! the `[1, C, H, W]` feature map into an [`Embedding`].

pub mod embedding;
pub mod error;
pub mod inference;
pub mod preprocessing;
pub mod processor_config;
pub mod test_image;
#[cfg(feature = "tract")]
pub mod tract_backend;

pub use embedding::{
    Embedding, EmbeddingStats, Pooling, center_point, extract_embedding, global_average_pool,
    global_max_pool,
};
pub use error::{EmbeddingError, Result};
pub use inference::{EmbeddingBackend, EmbeddingModel, ModelInfo, shared_model};
pub use preprocessing::{flatten, preprocess, preprocess_path};
pub use processor_config::{ProcessorConfig, ProcessorConfigBuilder, Resample};
#[cfg(feature = "tract")]
pub use tract_backend::TractEmbeddingModel;
