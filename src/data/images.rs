//! Image datasets and image grid export
//!
//! Datasets are returned as float tensors of shape [N, C, H, W] with
//! values in [0, 1].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tch::{vision, Device, Kind, Tensor};
use tracing::info;

use crate::model::ImageShape;

/// Where training images come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// MNIST idx files in a directory
    Mnist,
    /// Folder of image files, resized on load
    Images,
}

/// Dataset configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub source: DataSource,
    pub path: PathBuf,
    /// Target height for folder images
    pub image_height: i64,
    /// Target width for folder images
    pub image_width: i64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source: DataSource::Mnist,
            path: PathBuf::from("data/mnist"),
            image_height: 28,
            image_width: 28,
        }
    }
}

impl DataConfig {
    /// 64x64 RGB face crops for the WGAN-GP
    pub fn faces() -> Self {
        Self {
            source: DataSource::Images,
            path: PathBuf::from("data/celeb"),
            image_height: 64,
            image_width: 64,
        }
    }

    /// Shape of the images this source yields
    pub fn image_shape(&self) -> ImageShape {
        match self.source {
            DataSource::Mnist => ImageShape::new(1, 28, 28),
            DataSource::Images => ImageShape::new(3, self.image_height, self.image_width),
        }
    }
}

/// Load MNIST train and test images as [N, 1, 28, 28]
pub fn load_mnist<P: AsRef<Path>>(dir: P) -> anyhow::Result<(Tensor, Tensor)> {
    let dir = dir.as_ref();
    let dataset = vision::mnist::load_dir(dir)?;

    let x_train = dataset.train_images.view([-1, 1, 28, 28]);
    let x_test = dataset.test_images.view([-1, 1, 28, 28]);
    info!(
        "Loaded MNIST from {}: {} train, {} test images",
        dir.display(),
        x_train.size()[0],
        x_test.size()[0]
    );

    Ok((x_train, x_test))
}

/// Load every image of a folder, resized to `height` x `width`, as [N, 3, H, W]
pub fn load_image_folder<P: AsRef<Path>>(
    dir: P,
    height: i64,
    width: i64,
) -> anyhow::Result<Tensor> {
    let dir = dir.as_ref();
    let images = vision::image::load_dir(dir, width, height)?;
    let images = images.to_kind(Kind::Float) / 255.0;

    info!("Loaded {} images from {}", images.size()[0], dir.display());
    Ok(images)
}

/// Load the training images described by `config`
pub fn load_dataset(config: &DataConfig) -> anyhow::Result<Tensor> {
    match config.source {
        DataSource::Mnist => Ok(load_mnist(&config.path)?.0),
        DataSource::Images => {
            load_image_folder(&config.path, config.image_height, config.image_width)
        }
    }
}

/// Map [0, 1] pixels to the generator's [-1, 1] range
pub fn to_tanh_range(images: &Tensor) -> Tensor {
    images * 2.0 - 1.0
}

/// Tile the first `rows * cols` images into one PNG
///
/// `images` is [N, C, H, W] with values in [0, 1]. Single-channel grids
/// are inverted when `invert_grey` is set (dark strokes on white).
pub fn save_image_grid<P: AsRef<Path>>(
    images: &Tensor,
    rows: i64,
    cols: i64,
    invert_grey: bool,
    path: P,
) -> anyhow::Result<()> {
    let size = images.size();
    if size.len() != 4 {
        anyhow::bail!("Expected images of shape [N, C, H, W], got {:?}", size);
    }
    let (n, c, h, w) = (size[0], size[1], size[2], size[3]);
    if n < rows * cols {
        anyhow::bail!("Need {} images for a {}x{} grid, got {}", rows * cols, rows, cols, n);
    }
    if c != 1 && c != 3 {
        anyhow::bail!("Unsupported channel count {}", c);
    }

    let grid = images
        .narrow(0, 0, rows * cols)
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .clamp(0.0, 1.0)
        .view([rows, cols, c, h, w])
        .permute([2, 0, 3, 1, 4])
        .reshape([c, rows * h, cols * w]);

    let grid = if c == 1 {
        let grid = if invert_grey { -grid + 1.0 } else { grid };
        grid.repeat([3, 1, 1])
    } else {
        grid
    };

    let grid = (grid * 255.0).round().to_kind(Kind::Uint8);

    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    vision::image::save(&grid, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_tanh_range() {
        let x = Tensor::from_slice(&[0.0f32, 0.5, 1.0]);
        let y = Vec::<f32>::try_from(to_tanh_range(&x)).unwrap();
        assert_eq!(y, vec![-1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_save_grey_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid/sample.png");

        let images = Tensor::zeros([6, 1, 4, 5], (Kind::Float, Device::Cpu));
        save_image_grid(&images, 2, 3, true, &path).unwrap();

        let loaded = vision::image::load(&path).unwrap();
        assert_eq!(loaded.size(), vec![3, 8, 15]);
        // Black input becomes white once inverted
        assert_eq!(loaded.int64_value(&[0, 0, 0]), 255);
    }

    #[test]
    fn test_save_colour_grid_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colour.png");

        let images = Tensor::ones([4, 3, 2, 2], (Kind::Float, Device::Cpu));
        save_image_grid(&images, 2, 2, true, &path).unwrap();

        let loaded = vision::image::load(&path).unwrap();
        assert_eq!(loaded.size(), vec![3, 4, 4]);
        assert_eq!(loaded.int64_value(&[1, 3, 3]), 255);
    }

    #[test]
    fn test_save_grid_needs_enough_images() {
        let dir = tempfile::tempdir().unwrap();
        let images = Tensor::zeros([3, 1, 4, 4], (Kind::Float, Device::Cpu));
        assert!(save_image_grid(&images, 2, 2, false, dir.path().join("x.png")).is_err());
    }

    #[test]
    fn test_load_image_folder_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let image = Tensor::full([3, 10, 12], 200i64, (Kind::Uint8, Device::Cpu));
        vision::image::save(&image, dir.path().join("a.png")).unwrap();
        vision::image::save(&image, dir.path().join("b.png")).unwrap();

        let images = load_image_folder(dir.path(), 8, 6).unwrap();
        assert_eq!(images.size(), vec![2, 3, 8, 6]);
        assert!(images.max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn test_load_mnist_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_mnist(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_image_shape_per_source() {
        assert_eq!(DataConfig::default().image_shape(), ImageShape::new(1, 28, 28));
        assert_eq!(DataConfig::faces().image_shape(), ImageShape::new(3, 64, 64));
    }

    #[test]
    fn test_data_config_serde() {
        let config = DataConfig {
            source: DataSource::Images,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"images\""));
        let back: DataConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
