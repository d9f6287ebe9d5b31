//! Convolutional Autoencoder and WGAN-GP
//!
//! Main entry point providing CLI interface for:
//! - Writing a default configuration
//! - Training the autoencoder and reconstructing images
//! - Training the WGAN-GP and sampling images

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tch::{Device, Tensor};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use rust_ae_wgangp::{
    data::{load_dataset, load_mnist, save_image_grid, to_tanh_range, DataSource},
    model::{Autoencoder, WganGp},
    utils::Config,
};

/// Convolutional autoencoder and WGAN-GP image models
#[derive(Parser)]
#[command(name = "ae_wgangp")]
#[command(version = "0.1.0")]
#[command(about = "Train a convolutional autoencoder or a WGAN-GP on images")]
struct Cli {
    /// Path to configuration file (.json or .toml)
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Verbosity level
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelKind {
    Autoencoder,
    Wgan,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize default configuration file
    Init {
        /// Output configuration file path
        #[arg(short, long, default_value = "config.json")]
        output: String,
    },

    /// Print the layer table of a model
    Summary {
        #[arg(value_enum)]
        model: ModelKind,
    },

    /// Train the autoencoder
    TrainAe {
        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Continue from the run folder's saved weights
        #[arg(long)]
        resume: bool,
    },

    /// Reconstruct test images with a trained autoencoder
    Reconstruct {
        /// Run folder of the trained autoencoder
        #[arg(short, long)]
        run_folder: Option<PathBuf>,

        /// Number of images to reconstruct
        #[arg(short, long, default_value = "10")]
        num_images: i64,

        /// Output image path
        #[arg(short, long, default_value = "reconstructions.png")]
        output: PathBuf,
    },

    /// Train the WGAN-GP
    TrainWgan {
        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Continue from the run folder's saved model
        #[arg(long)]
        resume: bool,
    },

    /// Write a 5x5 grid of generated images
    Sample {
        /// Run folder of the trained WGAN-GP
        #[arg(short, long)]
        run_folder: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { output } => init_config(&output)?,
        Commands::Summary { model } => {
            let config = load_config(&cli.config)?;
            show_summary(&config, model)?;
        }
        Commands::TrainAe { epochs, resume } => {
            let config = load_config(&cli.config)?;
            train_autoencoder(config, epochs, resume)?;
        }
        Commands::Reconstruct {
            run_folder,
            num_images,
            output,
        } => {
            let config = load_config(&cli.config)?;
            reconstruct(&config, run_folder, num_images, &output)?;
        }
        Commands::TrainWgan { epochs, resume } => {
            let config = load_config(&cli.config)?;
            train_wgan(config, epochs, resume)?;
        }
        Commands::Sample { run_folder } => {
            let config = load_config(&cli.config)?;
            sample(&config, run_folder)?;
        }
    }

    Ok(())
}

fn load_config(path: &str) -> Result<Config> {
    let config = if Path::new(path).exists() {
        Config::load(path)?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

/// Initialize default configuration file
fn init_config(output_path: &str) -> Result<()> {
    Config::default().save(output_path)?;
    info!("Created default configuration at {}", output_path);
    Ok(())
}

fn show_summary(config: &Config, model: ModelKind) -> Result<()> {
    let device = Device::Cpu;
    let table = match model {
        ModelKind::Autoencoder => Autoencoder::new(config.autoencoder.clone(), device)?
            .summary()
            .to_table(),
        ModelKind::Wgan => WganGp::new(config.wgan.clone(), device)?.summary().to_table(),
    };
    println!("{}", table);
    Ok(())
}

/// Train the autoencoder on the configured dataset
fn train_autoencoder(config: Config, epochs: Option<usize>, resume: bool) -> Result<()> {
    let device = config.get_device();
    info!("Using device: {:?}", device);

    let x_train = load_dataset(&config.data)?;

    let mut training = config.ae_training.clone();
    if let Some(epochs) = epochs {
        training.epochs = epochs;
    }
    let run_folder = training.run_folder.clone();

    let mut model = Autoencoder::new(config.autoencoder.clone(), device)?;
    model.save(&run_folder)?;
    if resume {
        model.load_weights(run_folder.join("weights").join("weights.ot"))?;
    }
    model.compile(training.learning_rate)?;

    let metrics = model.train(&x_train, training)?;

    info!(
        "Training complete. Final loss: {:.4}, best loss: {:.4}",
        metrics.latest_loss().unwrap_or(0.0),
        metrics.best_loss().unwrap_or(0.0)
    );
    Ok(())
}

/// Save originals (top row) above their reconstructions (bottom row)
fn reconstruct(
    config: &Config,
    run_folder: Option<PathBuf>,
    num_images: i64,
    output: &Path,
) -> Result<()> {
    let device = config.get_device();
    let run_folder = run_folder.unwrap_or_else(|| config.ae_training.run_folder.clone());

    let mut model = Autoencoder::load(&run_folder, device)?;
    model.load_weights(run_folder.join("weights").join("weights.ot"))?;

    let images = match config.data.source {
        DataSource::Mnist => load_mnist(&config.data.path)?.1,
        DataSource::Images => load_dataset(&config.data)?,
    };
    let n = num_images.min(images.size()[0]);
    if n <= 0 {
        anyhow::bail!("No images to reconstruct");
    }

    let originals = images.narrow(0, 0, n).to_device(device);
    let codes = model.encode(&originals).to_device(Device::Cpu);
    debug!("Latent codes: {:?}", Vec::<f32>::try_from(codes.flatten(0, -1))?);

    let reconstructions = model.reconstruct(&originals);
    let grid = Tensor::cat(&[originals, reconstructions], 0);
    save_image_grid(&grid, 2, n, true, output)?;

    info!("Saved {} reconstructions to {}", n, output.display());
    Ok(())
}

/// Train the WGAN-GP on its configured dataset
fn train_wgan(config: Config, epochs: Option<usize>, resume: bool) -> Result<()> {
    let device = config.get_device();
    info!("Using device: {:?}", device);

    let x_train = to_tanh_range(&load_dataset(&config.wgan_data)?);

    let mut training = config.wgan_training.clone();
    if let Some(epochs) = epochs {
        training.epochs = epochs;
    }
    let run_folder = training.run_folder.clone();

    let mut model = if resume {
        WganGp::load(&run_folder, device)?
    } else {
        let model = WganGp::new(config.wgan.clone(), device)?;
        model.save(&run_folder)?;
        model
    };

    let metrics = model.train(&x_train, training)?;

    if let (Some(d), Some(g)) = (metrics.latest_d_loss(), metrics.latest_g_loss()) {
        info!(
            "Training complete at epoch {}. Final D_loss: {:.4}, G_loss: {:.4}",
            model.epoch, d.total, g
        );
    }
    Ok(())
}

/// Write a sample grid from a trained WGAN-GP
fn sample(config: &Config, run_folder: Option<PathBuf>) -> Result<()> {
    let device = config.get_device();
    let run_folder = run_folder.unwrap_or_else(|| config.wgan_training.run_folder.clone());

    let model = WganGp::load(&run_folder, device)?;
    let path = model.sample_images(&run_folder)?;

    info!("Saved samples to {}", path.display());
    Ok(())
}
