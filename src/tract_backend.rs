//! Pure-Rust inference path over `tract-onnx`.

use std::path::Path;

use ndarray::{Array4, ArrayD, IxDyn};
use tract_onnx::prelude::*;

use crate::error::{EmbeddingError, Result};
use crate::inference::EmbeddingBackend;
use crate::processor_config::ProcessorConfig;

type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

pub struct TractEmbeddingModel {
    model: TractModel,
    config: ProcessorConfig,
}

impl TractEmbeddingModel {
    /// Loads and optimises the ONNX graph for a fixed `[1, 3, crop_h, crop_w]`
    /// input, so cropping must be enabled in `config`.
    pub fn new(model_path: &Path, config: ProcessorConfig) -> Result<Self> {
        if !model_path.exists() {
            return Err(EmbeddingError::InvalidPath(format!(
                "Model file not found: {model_path:?}"
            )));
        }
        let shape = config.input_shape().ok_or_else(|| {
            EmbeddingError::invalid_config("tract needs a fixed input size; enable center crop")
        })?;

        tracing::info!(?model_path, ?shape, "loading ONNX model with tract");
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .map_err(|e| EmbeddingError::inference(format!("Failed to load ONNX model: {e}")))?
            .with_input_fact(0, f32::fact(shape).into())
            .map_err(|e| EmbeddingError::inference(format!("Failed to set input fact: {e}")))?
            .into_optimized()
            .map_err(|e| EmbeddingError::inference(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| EmbeddingError::inference(format!("Failed to build runnable model: {e}")))?;

        Ok(Self { model, config })
    }
}

impl EmbeddingBackend for TractEmbeddingModel {
    fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn run(&self, input: &Array4<f32>) -> Result<ArrayD<f32>> {
        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_shape(input.shape(), &data)
            .map_err(|e| EmbeddingError::inference(format!("Failed to build input tensor: {e}")))?;

        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .map_err(|e| EmbeddingError::inference(format!("Inference failed: {e}")))?;
        let output = outputs
            .first()
            .ok_or_else(|| EmbeddingError::ModelContract("model produced no outputs".into()))?;

        let shape = output.shape().to_vec();
        let values = output
            .as_slice::<f32>()
            .map_err(|e| EmbeddingError::inference(format!("Unexpected output type: {e}")))?
            .to_vec();
        tracing::debug!(?shape, "tract inference done");

        Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
    }
}
