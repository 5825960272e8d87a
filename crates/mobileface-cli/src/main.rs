use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use mobileface_core::{preprocess, Embedding, FaceTrainer, MobileFaceNet, TrainConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mobileface", about = "MobileFaceNet embedding model tools")]
struct Cli {
    /// TOML config file (defaults to MOBILEFACE_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the network structure and a per-layer shape/parameter summary
    Summary {
        /// Checkpoint to load (random initialization when omitted)
        #[arg(short, long)]
        weights: Option<PathBuf>,
    },
    /// Build a training checkpoint from pretrained MobileNet-V2 weights
    Init {
        /// torchvision MobileNet-V2 weights exported to safetensors
        #[arg(short, long)]
        pretrained: PathBuf,
        /// Output checkpoint path
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Extract embeddings for one or more face crops and print them as JSON
    Embed {
        #[arg(short, long)]
        weights: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Compare two face crops by cosine similarity
    Compare {
        #[arg(short, long)]
        weights: PathBuf,
        first: PathBuf,
        second: PathBuf,
        /// Cosine similarity threshold for a match
        #[arg(short, long, default_value_t = 0.4)]
        threshold: f32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TrainConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => TrainConfig::from_env()?,
    };
    let device = config.device.device()?;

    match cli.command {
        Commands::Summary { weights } => summary(&config, &device, weights.as_deref())?,
        Commands::Init { pretrained, out } => {
            let trainer = FaceTrainer::with_pretrained(&config, &device, &pretrained)
                .with_context(|| format!("loading pretrained backbone {}", pretrained.display()))?;
            trainer.save(&out)?;
            println!(
                "Wrote {} ({} tensors, {} classes)",
                out.display(),
                trainer.vars().len(),
                trainer.head().num_classes()
            );
        }
        Commands::Embed { weights, images } => {
            let embeddings = embed(&config, &device, &weights, &images)?;
            println!("{}", serde_json::to_string_pretty(&embeddings)?);
        }
        Commands::Compare { weights, first, second, threshold } => {
            let embeddings = embed(&config, &device, &weights, &[first, second])?;
            let similarity = embeddings[0].similarity(&embeddings[1]);
            println!(
                "{}",
                serde_json::json!({
                    "similarity": similarity,
                    "threshold": threshold,
                    "matched": similarity >= threshold,
                })
            );
        }
    }

    Ok(())
}

fn summary(config: &TrainConfig, device: &Device, weights: Option<&Path>) -> Result<()> {
    let network = match weights {
        Some(path) => MobileFaceNet::load(path, &config.model, device)?,
        None => {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
            MobileFaceNet::new(vb, &config.model)?
        }
    };

    let size = config.model.input_size;
    let input = Tensor::zeros((1, 3, size, size), DType::F32, device)?;
    let summary = network.summarize(&input)?;

    println!("{network}");
    println!("{summary}");
    Ok(())
}

fn embed(
    config: &TrainConfig,
    device: &Device,
    weights: &Path,
    images: &[PathBuf],
) -> Result<Vec<Embedding>> {
    let network = MobileFaceNet::load(weights, &config.model, device)?;
    let paths: Vec<&Path> = images.iter().map(PathBuf::as_path).collect();
    let batch = preprocess::load_batch(&paths, network.input_size(), device)?;
    let output = network.embed(&batch)?;

    let version = weights.file_name().and_then(|n| n.to_str());
    let embeddings = Embedding::from_tensor(&output, version)?;
    tracing::debug!(count = embeddings.len(), dim = network.emb_size(), "extracted embeddings");
    Ok(embeddings)
}
