//! WGAN-GP wrapper combining Critic and Generator
//!
//! The critic and the generator own separate variable stores and
//! optimizers, so a critic step never moves generator weights and vice
//! versa.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tch::{nn, nn::OptimizerConfig, nn::VarStore, Device, Kind, Tensor};
use tracing::info;

use super::critic::{Critic, CriticConfig};
use super::generator::{Generator, GeneratorConfig};
use super::layers::{ImageShape, ModelSummary};
use crate::data::{save_image_grid, BatchSource, DataLoader, RandomSampler};
use crate::training::losses::{gradient_penalty_loss, random_weighted_average, wasserstein};
use crate::training::{CriticLoss, WganMetrics, WganTrainer, WganTrainingConfig};
use crate::utils::checkpoint::{
    create_run_folder, load_params, load_training_state, save_params, save_training_state,
    TrainingState,
};

/// Full WGAN-GP hyper-parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WganGpConfig {
    pub input_dim: ImageShape,
    pub critic_conv_filters: Vec<i64>,
    pub critic_conv_kernel_size: Vec<i64>,
    pub critic_conv_strides: Vec<i64>,
    pub critic_batch_norm_momentum: Option<f64>,
    pub critic_activation: String,
    pub critic_dropout_rate: Option<f64>,
    pub critic_learning_rate: f64,
    pub generator_initial_dense_layer_size: ImageShape,
    pub generator_upsample: Vec<i64>,
    pub generator_conv_filters: Vec<i64>,
    pub generator_conv_kernel_size: Vec<i64>,
    pub generator_conv_strides: Vec<i64>,
    pub generator_batch_norm_momentum: Option<f64>,
    pub generator_activation: String,
    pub generator_dropout_rate: Option<f64>,
    pub generator_learning_rate: f64,
    /// "adam", "rmsprop", anything else falls back to plain Adam
    pub optimiser: String,
    /// Weight of the gradient penalty in the critic loss
    pub grad_weight: f64,
    pub z_dim: i64,
    pub batch_size: i64,
}

impl Default for WganGpConfig {
    /// 64x64 RGB faces
    fn default() -> Self {
        Self {
            input_dim: ImageShape::new(3, 64, 64),
            critic_conv_filters: vec![64, 128, 256, 512],
            critic_conv_kernel_size: vec![5, 5, 5, 5],
            critic_conv_strides: vec![2, 2, 2, 2],
            critic_batch_norm_momentum: None,
            critic_activation: "leaky_relu".to_string(),
            critic_dropout_rate: None,
            critic_learning_rate: 0.0002,
            generator_initial_dense_layer_size: ImageShape::new(512, 4, 4),
            generator_upsample: vec![1, 1, 1, 1],
            generator_conv_filters: vec![256, 128, 64, 3],
            generator_conv_kernel_size: vec![5, 5, 5, 5],
            generator_conv_strides: vec![2, 2, 2, 2],
            generator_batch_norm_momentum: Some(0.9),
            generator_activation: "leaky_relu".to_string(),
            generator_dropout_rate: None,
            generator_learning_rate: 0.0002,
            optimiser: "adam".to_string(),
            grad_weight: 10.0,
            z_dim: 100,
            batch_size: 64,
        }
    }
}

impl WganGpConfig {
    pub fn critic(&self) -> CriticConfig {
        CriticConfig {
            input_dim: self.input_dim,
            conv_filters: self.critic_conv_filters.clone(),
            conv_kernel_size: self.critic_conv_kernel_size.clone(),
            conv_strides: self.critic_conv_strides.clone(),
            batch_norm_momentum: self.critic_batch_norm_momentum,
            activation: self.critic_activation.clone(),
            dropout_rate: self.critic_dropout_rate,
        }
    }

    pub fn generator(&self) -> GeneratorConfig {
        GeneratorConfig {
            z_dim: self.z_dim,
            initial_dense_layer_size: self.generator_initial_dense_layer_size,
            upsample: self.generator_upsample.clone(),
            conv_filters: self.generator_conv_filters.clone(),
            conv_kernel_size: self.generator_conv_kernel_size.clone(),
            conv_strides: self.generator_conv_strides.clone(),
            batch_norm_momentum: self.generator_batch_norm_momentum,
            activation: self.generator_activation.clone(),
            dropout_rate: self.generator_dropout_rate,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let n = self.critic_conv_filters.len();
        if n == 0 || self.critic_conv_kernel_size.len() != n || self.critic_conv_strides.len() != n
        {
            anyhow::bail!("Critic filter sizes, kernel sizes, and strides must have the same non-zero length.");
        }

        let m = self.generator_conv_filters.len();
        if m == 0
            || self.generator_upsample.len() != m
            || self.generator_conv_kernel_size.len() != m
            || self.generator_conv_strides.len() != m
        {
            anyhow::bail!("Generator upsample flags, filter sizes, kernel sizes, and strides must have the same non-zero length.");
        }

        let positive = self
            .critic_conv_filters
            .iter()
            .chain(&self.critic_conv_kernel_size)
            .chain(&self.critic_conv_strides)
            .chain(&self.generator_conv_filters)
            .chain(&self.generator_conv_kernel_size)
            .chain(&self.generator_conv_strides)
            .all(|&v| v > 0);
        if !positive {
            anyhow::bail!("Filters, kernel sizes and strides must all be > 0");
        }
        if !self.input_dim.is_valid() || !self.generator_initial_dense_layer_size.is_valid() {
            anyhow::bail!("Image shapes must have positive dimensions");
        }
        if self.z_dim <= 0 {
            anyhow::bail!("Latent dimension must be > 0");
        }
        if self.batch_size <= 0 {
            anyhow::bail!("Batch size must be > 0");
        }
        if self.grad_weight < 0.0 {
            anyhow::bail!("Gradient penalty weight must be >= 0");
        }
        for rate in [self.critic_dropout_rate, self.generator_dropout_rate]
            .into_iter()
            .flatten()
        {
            if !(0.0..1.0).contains(&rate) {
                anyhow::bail!("Dropout rate must be in [0, 1), got {}", rate);
            }
        }
        for momentum in [
            self.critic_batch_norm_momentum,
            self.generator_batch_norm_momentum,
        ]
        .into_iter()
        .flatten()
        {
            if !(0.0..=1.0).contains(&momentum) {
                anyhow::bail!("Batch norm momentum must be in [0, 1], got {}", momentum);
            }
        }

        let output = self.generator().output_shape();
        if output != self.input_dim {
            anyhow::bail!(
                "Generator output shape {} does not match critic input shape {}",
                output,
                self.input_dim
            );
        }
        Ok(())
    }
}

/// Optimizer family selected by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimiserKind {
    /// Adam with beta1 = 0.5
    Adam,
    /// RMSprop with rho = 0.9
    RmsProp,
    /// Adam with library defaults
    Default,
}

impl OptimiserKind {
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "adam" => OptimiserKind::Adam,
            "rmsprop" => OptimiserKind::RmsProp,
            _ => OptimiserKind::Default,
        }
    }

    /// Build an optimizer over every trainable variable of `vs`
    pub fn build(&self, vs: &VarStore, lr: f64) -> anyhow::Result<nn::Optimizer> {
        let optimizer = match self {
            OptimiserKind::Adam => nn::Adam {
                beta1: 0.5,
                ..Default::default()
            }
            .build(vs, lr)?,
            OptimiserKind::RmsProp => nn::RmsProp {
                alpha: 0.9,
                eps: 1e-7,
                ..Default::default()
            }
            .build(vs, lr)?,
            OptimiserKind::Default => nn::Adam::default().build(vs, lr)?,
        };
        Ok(optimizer)
    }
}

/// Complete WGAN-GP model
pub struct WganGp {
    /// Critic network
    pub critic: Critic,
    /// Generator network
    pub generator: Generator,
    /// Variable store for critic
    pub critic_vs: VarStore,
    /// Variable store for generator
    pub gen_vs: VarStore,
    /// Device (CPU/GPU)
    pub device: Device,
    /// Loss history
    pub metrics: WganMetrics,
    /// Number of completed training epochs
    pub epoch: usize,
    config: WganGpConfig,
    critic_opt: nn::Optimizer,
    gen_opt: nn::Optimizer,
    model_summary: ModelSummary,
}

impl WganGp {
    /// Build critic, generator and their optimizers
    pub fn new(config: WganGpConfig, device: Device) -> anyhow::Result<Self> {
        config.validate()?;

        let critic_vs = VarStore::new(device);
        let gen_vs = VarStore::new(device);

        let critic = Critic::new(&critic_vs.root(), config.critic())?;
        let generator = Generator::new(&gen_vs.root(), config.generator())?;

        let kind = OptimiserKind::from_name(&config.optimiser);
        let critic_opt = kind.build(&critic_vs, config.critic_learning_rate)?;
        let gen_opt = kind.build(&gen_vs, config.generator_learning_rate)?;

        let mut model_summary = ModelSummary::new("model");
        model_summary.push("model_input", "InputLayer", &[config.z_dim]);
        model_summary.push_model(generator.summary());
        model_summary.push_model(critic.summary());

        Ok(Self {
            critic,
            generator,
            critic_vs,
            gen_vs,
            device,
            metrics: WganMetrics::new(),
            epoch: 0,
            config,
            critic_opt,
            gen_opt,
            model_summary,
        })
    }

    /// Rebuild from a run folder: params, then weights and training state
    /// when a saved model is present
    pub fn load<P: AsRef<Path>>(run_folder: P, device: Device) -> anyhow::Result<Self> {
        let run_folder = run_folder.as_ref();
        let config: WganGpConfig = load_params(run_folder)?;
        let mut model = Self::new(config, device)?;

        if run_folder.join("critic.ot").exists() {
            model.load_model(run_folder)?;
        }
        Ok(model)
    }

    /// One critic update on real images from `batches` and fresh fakes
    ///
    /// Returns the total loss with its Wasserstein terms and the
    /// unweighted gradient penalty.
    pub fn train_critic(
        &mut self,
        batches: &mut dyn BatchSource,
        batch_size: i64,
    ) -> anyhow::Result<CriticLoss> {
        let true_imgs = batches.sample_batch(batch_size)?.to_device(self.device);
        self.check_images(&true_imgs)?;
        let n = true_imgs.size()[0];

        let valid = Tensor::ones([n, 1], (Kind::Float, self.device));
        let fake = -Tensor::ones([n, 1], (Kind::Float, self.device));

        let noise = Tensor::randn([n, self.config.z_dim], (Kind::Float, self.device));
        let fake_imgs = tch::no_grad(|| self.generator.forward_frozen(&noise));

        let real_out = self.critic.forward_t(&true_imgs, true);
        let fake_out = self.critic.forward_t(&fake_imgs, true);

        let interpolated = random_weighted_average(&true_imgs, &fake_imgs).set_requires_grad(true);
        let interpolated_out = self.critic.forward_t(&interpolated, true);

        let real_loss = wasserstein(&valid, &real_out);
        let fake_loss = wasserstein(&fake, &fake_out);
        let gp = gradient_penalty_loss(&interpolated_out, &interpolated);

        let total = &real_loss + &fake_loss + &gp * self.config.grad_weight;
        self.critic_opt.backward_step(&total);

        Ok(CriticLoss {
            total: total.double_value(&[]),
            real: real_loss.double_value(&[]),
            fake: fake_loss.double_value(&[]),
            gradient_penalty: gp.double_value(&[]),
        })
    }

    /// One generator update; the critic keeps its weights and batch norm
    /// statistics but still applies dropout
    pub fn train_generator(&mut self, batch_size: i64) -> f64 {
        let valid = Tensor::ones([batch_size, 1], (Kind::Float, self.device));
        let noise = Tensor::randn([batch_size, self.config.z_dim], (Kind::Float, self.device));

        let imgs = self.generator.forward_t(&noise, true);
        let scores = self.critic.forward_frozen(&imgs);
        let loss = wasserstein(&valid, &scores);

        self.gen_opt.backward_step(&loss);
        loss.double_value(&[])
    }

    /// Train for `config.epochs` further epochs on `x_train`
    ///
    /// With `using_generator` the images are served by a shuffling
    /// loader, otherwise each critic step samples random indices.
    pub fn train(
        &mut self,
        x_train: &Tensor,
        config: WganTrainingConfig,
    ) -> anyhow::Result<WganMetrics> {
        self.check_images(x_train)?;
        if x_train.size()[0] == 0 {
            anyhow::bail!("Training data is empty");
        }

        let mut source: Box<dyn BatchSource> = if config.using_generator {
            Box::new(DataLoader::new(
                x_train.shallow_clone(),
                self.config.batch_size as usize,
                true,
                false,
            ))
        } else {
            Box::new(RandomSampler::new(x_train.shallow_clone()))
        };

        let mut trainer = WganTrainer::new(config);
        trainer.train(self, source.as_mut())?;
        Ok(self.metrics.clone())
    }

    /// Reject image batches the critic cannot consume
    fn check_images(&self, images: &Tensor) -> anyhow::Result<()> {
        let expected = self.config.input_dim.dims();
        if images.dim() != 4 || images.size()[1..] != expected {
            anyhow::bail!(
                "Image shape {:?} does not match critic input {}",
                images.size(),
                self.config.input_dim
            );
        }
        Ok(())
    }

    /// Generate images from fresh noise (inference mode), in [-1, 1]
    pub fn generate(&self, num_samples: i64) -> Tensor {
        self.generator.generate_random(num_samples, self.device)
    }

    /// Write a 5x5 grid of generated images to `images/sample_{epoch}.png`
    pub fn sample_images<P: AsRef<Path>>(&self, run_folder: P) -> anyhow::Result<PathBuf> {
        let (rows, cols) = (5, 5);
        let gen_imgs = self.generate(rows * cols);
        let gen_imgs = ((gen_imgs + 1.0) * 0.5).clamp(0.0, 1.0);

        let path = run_folder
            .as_ref()
            .join("images")
            .join(format!("sample_{}.png", self.epoch));
        save_image_grid(&gen_imgs, rows, cols, true, &path)?;
        Ok(path)
    }

    /// Write the run folder skeleton, `params.json` and architecture files
    pub fn save<P: AsRef<Path>>(&self, folder: P) -> anyhow::Result<()> {
        let folder = folder.as_ref();
        create_run_folder(folder)?;
        save_params(folder, &self.config)?;
        self.plot_model(folder)
    }

    pub fn plot_model<P: AsRef<Path>>(&self, run_folder: P) -> anyhow::Result<()> {
        let viz = run_folder.as_ref().join("viz");
        std::fs::create_dir_all(&viz)?;
        self.model_summary.save(viz.join("model.txt"))?;
        self.critic.summary().save(viz.join("critic.txt"))?;
        self.generator.summary().save(viz.join("generator.txt"))?;
        Ok(())
    }

    /// Save critic and generator weights into `dir`
    pub fn save_weights<P: AsRef<Path>>(&self, dir: P) -> anyhow::Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.critic_vs.save(dir.join("critic.ot"))?;
        self.gen_vs.save(dir.join("generator.ot"))?;
        Ok(())
    }

    /// Load critic and generator weights from `dir`
    pub fn load_weights<P: AsRef<Path>>(&mut self, dir: P) -> anyhow::Result<()> {
        let dir = dir.as_ref();
        self.critic_vs.load(dir.join("critic.ot"))?;
        self.gen_vs.load(dir.join("generator.ot"))?;
        info!("Loaded weights from {}", dir.display());
        Ok(())
    }

    /// Save weights plus epoch and loss history into the run folder root
    pub fn save_model<P: AsRef<Path>>(&self, run_folder: P) -> anyhow::Result<()> {
        let run_folder = run_folder.as_ref();
        self.save_weights(run_folder)?;

        let state = TrainingState::new(self.epoch, &self.metrics);
        save_training_state(run_folder, &state)?;
        Ok(())
    }

    /// Restore what `save_model` wrote
    pub fn load_model<P: AsRef<Path>>(&mut self, run_folder: P) -> anyhow::Result<()> {
        let run_folder = run_folder.as_ref();
        self.load_weights(run_folder)?;

        if let Some(state) = load_training_state(run_folder)? {
            self.epoch = state.epoch;
            self.metrics = WganMetrics {
                d_losses: state.d_losses,
                g_losses: state.g_losses,
            };
            info!("Resuming at epoch {}", self.epoch);
        }
        Ok(())
    }

    pub fn config(&self) -> &WganGpConfig {
        &self.config
    }

    pub fn summary(&self) -> &ModelSummary {
        &self.model_summary
    }

    pub fn z_dim(&self) -> i64 {
        self.config.z_dim
    }
}
