use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mobilenet_embedder::embedding::{EmbeddingStats, Pooling, extract_embedding};
use mobilenet_embedder::inference::{
    EmbeddingBackend, EmbeddingModel, MODEL_FILE, default_model_dir, shared_model,
};
use mobilenet_embedder::preprocessing::{flatten, preprocess_path};
use mobilenet_embedder::processor_config::ProcessorConfig;
use mobilenet_embedder::test_image::create_test_image;

#[derive(Debug, Parser)]
#[command(name = "mobilenet-embedder", version, about = "Extract image embeddings with a MobileNetV2 ONNX model")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// HuggingFace preprocessor_config.json to use instead of the defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Preprocess an image, run the model and print the pooled embedding
    Embed {
        image: PathBuf,

        /// Directory containing model.onnx and preprocessor_config.json
        #[arg(long, conflicts_with = "model")]
        model_dir: Option<PathBuf>,

        /// Path to an ONNX model file
        #[arg(long)]
        model: Option<PathBuf>,

        /// Run the model with tract instead of ONNX Runtime
        #[cfg(feature = "tract")]
        #[arg(long, requires = "model")]
        tract: bool,

        #[arg(long, default_value = "average")]
        pooling: Pooling,

        /// Print every pooling strategy side by side
        #[arg(long)]
        all_poolings: bool,

        /// Number of leading values to print
        #[arg(long, default_value_t = 5)]
        preview: usize,
    },
    /// Run only the preprocessing pipeline and print input statistics
    Preprocess { image: PathBuf },
    /// Print the model's declared inputs and outputs
    Inspect {
        #[arg(long)]
        model: PathBuf,
    },
    /// Write the synthetic 300x200 test image
    CreateTestImage {
        #[arg(short, long, default_value = "test_image.png")]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ProcessorConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(ProcessorConfig::from_file(path)?),
        None => Ok(ProcessorConfig::default()),
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Embed {
            image,
            model_dir,
            model,
            #[cfg(feature = "tract")]
            tract,
            pooling,
            all_poolings,
            preview,
        } => {
            let poolings = if all_poolings {
                Pooling::ALL.to_vec()
            } else {
                vec![pooling]
            };

            #[cfg(feature = "tract")]
            if tract {
                if let Some(model) = &model {
                    let config = load_config(cli.config.as_deref())?;
                    let backend = mobilenet_embedder::TractEmbeddingModel::new(model, config)?;
                    return embed(&backend, &image, &poolings, preview);
                }
            }

            let config = cli.config.as_deref().map(ProcessorConfig::from_file).transpose()?;
            match model_source(model_dir, model, config.is_some()) {
                ModelSource::File(model) => {
                    let config = config.unwrap_or_default();
                    let backend = EmbeddingModel::new(&model, config)?;
                    embed(&backend, &image, &poolings, preview)
                }
                ModelSource::Dir(model_dir) => {
                    let backend = EmbeddingModel::from_dir(&model_dir)?;
                    embed(&backend, &image, &poolings, preview)
                }
                ModelSource::Shared => {
                    let backend = shared_model().map_err(|e| e.to_string())?;
                    embed(backend.as_ref(), &image, &poolings, preview)
                }
            }
        }
        Command::Preprocess { image } => {
            let config = load_config(cli.config.as_deref())?;
            let tensor = preprocess_path(&image, &config)?;
            let values = flatten(&tensor);

            println!("Preprocessed {image:?}");
            println!("Tensor shape: {:?}", tensor.shape());
            println!("Flattened length: {}", values.len());
            println!("Input stats: {}", EmbeddingStats::of(&values));
            println!("First 10 values: {:?}", &values[..values.len().min(10)]);
            Ok(())
        }
        Command::Inspect { model } => {
            let config = load_config(cli.config.as_deref())?;
            let backend = EmbeddingModel::new(&model, config)?;
            let info = backend.describe();

            println!("Model inputs:");
            for input in &info.inputs {
                println!("  {}: {}", input.name, input.description);
            }
            println!("Model outputs:");
            for output in &info.outputs {
                println!("  {}: {}", output.name, output.description);
            }
            println!(
                "Binding input '{}' and reading output '{}'",
                backend.input_name(),
                backend.output_name()
            );
            Ok(())
        }
        Command::CreateTestImage { output } => {
            create_test_image().save(&output)?;
            println!("Test image written to {output:?}");
            Ok(())
        }
    }
}

/// Where the embed command takes its model from. An explicit `--config`
/// means the directory's own JSON must not be used.
#[derive(Debug, PartialEq, Eq)]
enum ModelSource {
    File(PathBuf),
    Dir(PathBuf),
    Shared,
}

fn model_source(model_dir: Option<PathBuf>, model: Option<PathBuf>, has_config: bool) -> ModelSource {
    match (model_dir, model, has_config) {
        (_, Some(model), _) => ModelSource::File(model),
        (Some(model_dir), None, true) => ModelSource::File(model_dir.join(MODEL_FILE)),
        (Some(model_dir), None, false) => ModelSource::Dir(model_dir),
        (None, None, true) => ModelSource::File(default_model_dir().join(MODEL_FILE)),
        (None, None, false) => ModelSource::Shared,
    }
}

fn embed(
    backend: &dyn EmbeddingBackend,
    image: &Path,
    poolings: &[Pooling],
    preview: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let input = preprocess_path(image, backend.config())?;
    tracing::info!(shape = ?input.shape(), "image preprocessed");

    let output = backend.run(&input)?;
    let embeddings = poolings
        .iter()
        .map(|&pooling| extract_embedding(output.view(), pooling).map(|e| (pooling, e)))
        .collect::<Result<Vec<_>, _>>()?;

    println!("Output tensor shape: {:?}", output.shape());
    let raw: Vec<f32> = output.iter().copied().collect();
    println!("Raw output stats: {}", EmbeddingStats::of(&raw));

    for (pooling, embedding) in &embeddings {
        let shown = preview.min(embedding.len());
        println!("{pooling} pooling: {}", embedding.stats());
        println!("  first {shown} values: {:?}", &embedding.as_slice()[..shown]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_flag_always_wins() {
        let source = model_source(Some("dir".into()), Some("m.onnx".into()), false);
        assert_eq!(source, ModelSource::File("m.onnx".into()));
    }

    #[test]
    fn model_dir_uses_its_own_json_without_config() {
        assert_eq!(
            model_source(Some("dir".into()), None, false),
            ModelSource::Dir("dir".into())
        );
    }

    #[test]
    fn explicit_config_bypasses_directory_json() {
        assert_eq!(
            model_source(Some("dir".into()), None, true),
            ModelSource::File(Path::new("dir").join(MODEL_FILE))
        );
        assert_eq!(
            model_source(None, None, true),
            ModelSource::File(default_model_dir().join(MODEL_FILE))
        );
    }

    #[test]
    fn shared_model_only_without_flags() {
        assert_eq!(model_source(None, None, false), ModelSource::Shared);
    }

    struct RankThreeBackend(ProcessorConfig);

    impl EmbeddingBackend for RankThreeBackend {
        fn config(&self) -> &ProcessorConfig {
            &self.0
        }

        fn run(
            &self,
            _input: &ndarray::Array4<f32>,
        ) -> mobilenet_embedder::Result<ndarray::ArrayD<f32>> {
            Ok(ndarray::ArrayD::zeros(vec![1, 1280, 49]))
        }
    }

    #[test]
    fn embed_fails_before_printing_on_bad_output_rank() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("test_image.png");
        create_test_image().save(&image).unwrap();

        let backend = RankThreeBackend(ProcessorConfig::default());
        let err = embed(&backend, &image, &Pooling::ALL, 5).unwrap_err();
        assert!(err.to_string().contains("rank-4"));
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from([
            "mobilenet-embedder",
            "embed",
            "cat.png",
            "--model-dir",
            "model",
            "--config",
            "custom.json",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.json")));
    }
}
