//! ONNX Runtime driver: binds the preprocessed tensor to the model input and
//! hands the raw feature map to the extractor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use ndarray::{Array4, ArrayD};
use once_cell::sync::Lazy;
use ort::inputs;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionOutputs};
use ort::value::ValueType;

use crate::embedding::{Embedding, Pooling, extract_embedding};
use crate::error::{EmbeddingError, Result};
use crate::preprocessing::{load_image, preprocess};
use crate::processor_config::ProcessorConfig;

pub const DEFAULT_INPUT_NAME: &str = "pixel_values";
pub const DEFAULT_OUTPUT_NAME: &str = "last_hidden_state";

pub const MODEL_FILE: &str = "model.onnx";
pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";

/// Anything that can turn an NCHW input tensor into the model's raw output.
pub trait EmbeddingBackend {
    fn config(&self) -> &ProcessorConfig;

    fn run(&self, input: &Array4<f32>) -> Result<ArrayD<f32>>;

    fn embed(&self, image: &DynamicImage) -> Result<Embedding> {
        self.embed_with(image, Pooling::Average)
    }

    fn embed_with(&self, image: &DynamicImage, pooling: Pooling) -> Result<Embedding> {
        let input = preprocess(image, self.config())?;
        let output = self.run(&input)?;
        extract_embedding(output.view(), pooling)
    }

    fn embed_path(&self, path: &Path) -> Result<Embedding> {
        let image = load_image(path)?;
        self.embed(&image)
    }
}

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub description: String,
}

/// Declared inputs and outputs of a loaded model.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
}

pub struct EmbeddingModel {
    session: Session,
    config: ProcessorConfig,
    input_name: String,
    output_name: String,
    input_dims: Option<Vec<i64>>,
}

impl EmbeddingModel {
    /// Loads `model.onnx` and `preprocessor_config.json` from `model_dir`.
    pub fn from_dir(model_dir: &Path) -> Result<Self> {
        let model_path = model_dir.join(MODEL_FILE);
        let config_path = model_dir.join(PREPROCESSOR_CONFIG_FILE);

        if !config_path.exists() {
            return Err(EmbeddingError::InvalidPath(format!(
                "Preprocessor config file not found: {config_path:?}"
            )));
        }
        let config = ProcessorConfig::from_file(&config_path)?;
        tracing::info!(?config_path, "preprocessor config loaded");

        Self::new(&model_path, config)
    }

    pub fn new(model_path: &Path, config: ProcessorConfig) -> Result<Self> {
        if !model_path.exists() {
            return Err(EmbeddingError::InvalidPath(format!(
                "Model file not found: {model_path:?}"
            )));
        }

        tracing::info!(?model_path, "loading ONNX model with ONNX Runtime");
        let session = SessionBuilder::new()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_cpus::get())?
            .commit_from_file(model_path)?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        tracing::debug!(?input_names, ?output_names, "model signature");

        let input_index = resolve_name(&input_names, DEFAULT_INPUT_NAME)
            .ok_or_else(|| EmbeddingError::ModelContract("model declares no inputs".into()))?;
        let output_index = resolve_name(&output_names, DEFAULT_OUTPUT_NAME)
            .ok_or_else(|| EmbeddingError::ModelContract("model declares no outputs".into()))?;

        let input_name = input_names[input_index].clone();
        let output_name = output_names[output_index].clone();
        if output_name != DEFAULT_OUTPUT_NAME {
            tracing::warn!(
                expected = DEFAULT_OUTPUT_NAME,
                using = %output_name,
                "output not found by name, using the first output"
            );
        }

        let input_dims = match &session.inputs[input_index].input_type {
            ValueType::Tensor { dimensions, .. } => Some(dimensions.clone()),
            _ => None,
        };

        tracing::info!(%input_name, %output_name, "ONNX Runtime session created");

        Ok(Self {
            session,
            config,
            input_name,
            output_name,
            input_dims,
        })
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    pub fn describe(&self) -> ModelInfo {
        ModelInfo {
            inputs: self
                .session
                .inputs
                .iter()
                .map(|i| TensorInfo {
                    name: i.name.clone(),
                    description: format!("{:?}", i.input_type),
                })
                .collect(),
            outputs: self
                .session
                .outputs
                .iter()
                .map(|o| TensorInfo {
                    name: o.name.clone(),
                    description: format!("{:?}", o.output_type),
                })
                .collect(),
        }
    }
}

impl EmbeddingBackend for EmbeddingModel {
    fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn run(&self, input: &Array4<f32>) -> Result<ArrayD<f32>> {
        if let Some(dims) = &self.input_dims {
            check_input_shape(dims, input.shape())?;
        }

        let inputs = inputs![self.input_name.as_str() => input.view()]?;
        tracing::debug!(input = %self.input_name, "running inference");
        let outputs: SessionOutputs = self.session.run(inputs)?;

        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            EmbeddingError::ModelContract(format!("model produced no output named {}", self.output_name))
        })?;
        let view = output.try_extract_tensor::<f32>()?;
        tracing::debug!(shape = ?view.shape(), "inference done");
        Ok(view.to_owned())
    }
}

/// Index of `preferred` in `declared`, else the first entry.
pub fn resolve_name(declared: &[String], preferred: &str) -> Option<usize> {
    declared
        .iter()
        .position(|name| name == preferred)
        .or_else(|| (!declared.is_empty()).then_some(0))
}

/// Compares a tensor shape with the model's declared dimensions; negative
/// declared dimensions are symbolic and match anything.
pub fn check_input_shape(declared: &[i64], actual: &[usize]) -> Result<()> {
    let matches = declared.len() == actual.len()
        && declared
            .iter()
            .zip(actual)
            .all(|(&want, &got)| want < 0 || want as usize == got);
    if !matches {
        return Err(EmbeddingError::shape(format!(
            "input tensor shape {actual:?} does not match model input {declared:?}"
        )));
    }
    Ok(())
}

/// `$MODEL_DIR`, or `model` when unset.
pub fn default_model_dir() -> PathBuf {
    std::env::var_os("MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("model"))
}

pub static GLOBAL_MODEL: Lazy<std::result::Result<Arc<EmbeddingModel>, EmbeddingError>> =
    Lazy::new(|| {
        let model_dir = default_model_dir();
        tracing::info!(?model_dir, "initializing shared embedding model");
        EmbeddingModel::from_dir(&model_dir).map(Arc::new)
    });

/// Process-wide model loaded from `$MODEL_DIR` on first use.
pub fn shared_model() -> std::result::Result<Arc<EmbeddingModel>, &'static EmbeddingError> {
    Lazy::force(&GLOBAL_MODEL).as_ref().map(Arc::clone)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stands in for a runtime: checks the bound input and answers with a
    /// constant MobileNetV2-sized feature map.
    struct ConstantBackend {
        config: ProcessorConfig,
        value: f32,
    }

    impl EmbeddingBackend for ConstantBackend {
        fn config(&self) -> &ProcessorConfig {
            &self.config
        }

        fn run(&self, input: &Array4<f32>) -> Result<ArrayD<f32>> {
            check_input_shape(&[1, 3, 224, 224], input.shape())?;
            Ok(ArrayD::from_elem(vec![1, 1280, 7, 7], self.value))
        }
    }

    fn constant_backend() -> ConstantBackend {
        ConstantBackend {
            config: ProcessorConfig::default(),
            value: 0.25,
        }
    }

    #[test]
    fn embed_chains_preprocess_run_and_pool() {
        let image = DynamicImage::ImageRgb8(crate::test_image::create_test_image());
        let embedding = constant_backend().embed(&image).unwrap();
        assert_eq!(embedding.len(), 1280);
        assert!(embedding.as_slice().iter().all(|&v| v == 0.25));
    }

    #[test]
    fn embed_with_applies_requested_pooling() {
        let image = DynamicImage::new_rgb8(300, 200);
        for pooling in Pooling::ALL {
            let embedding = constant_backend().embed_with(&image, pooling).unwrap();
            assert_eq!(embedding.len(), 1280);
            assert!(embedding.as_slice().iter().all(|&v| v == 0.25));
        }
    }

    #[test]
    fn embed_surfaces_preprocessing_errors() {
        let backend = ConstantBackend {
            config: ProcessorConfig::builder().do_resize(false).build().unwrap(),
            value: 1.0,
        };
        let err = backend.embed(&DynamicImage::new_rgb8(100, 100)).unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidConfig(_)));
    }

    #[test]
    fn embed_path_reports_missing_file() {
        let err = constant_backend()
            .embed_path(Path::new("no/such/image.png"))
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Io { .. }));
    }

    #[test]
    fn default_model_dir_is_never_empty() {
        assert!(!default_model_dir().as_os_str().is_empty());
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolve_prefers_named_entry() {
        let outputs = names(&["pooler_output", "last_hidden_state"]);
        assert_eq!(resolve_name(&outputs, DEFAULT_OUTPUT_NAME), Some(1));
    }

    #[test]
    fn resolve_falls_back_to_first_entry() {
        let outputs = names(&["features", "logits"]);
        assert_eq!(resolve_name(&outputs, DEFAULT_OUTPUT_NAME), Some(0));
        assert_eq!(resolve_name(&[], DEFAULT_OUTPUT_NAME), None);
    }

    #[test]
    fn input_shape_accepts_symbolic_batch() {
        assert!(check_input_shape(&[-1, 3, 224, 224], &[1, 3, 224, 224]).is_ok());
        assert!(check_input_shape(&[1, 3, 224, 224], &[1, 3, 224, 224]).is_ok());
    }

    #[test]
    fn input_shape_rejects_mismatch() {
        assert!(matches!(
            check_input_shape(&[1, 3, 224, 224], &[1, 3, 256, 256]),
            Err(EmbeddingError::Shape(_))
        ));
        assert!(check_input_shape(&[1, 3, 224], &[1, 3, 224, 224]).is_err());
    }

    #[test]
    fn missing_model_file_is_invalid_path() {
        let err = EmbeddingModel::new(Path::new("does/not/exist.onnx"), ProcessorConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, EmbeddingError::InvalidPath(_)));
    }

    #[test]
    fn missing_model_dir_is_invalid_path() {
        let err = EmbeddingModel::from_dir(Path::new("does/not/exist")).err().unwrap();
        assert!(matches!(err, EmbeddingError::InvalidPath(_)));
    }
}
