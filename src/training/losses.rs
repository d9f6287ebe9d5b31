//! Loss functions
//!
//! Implements the autoencoder reconstruction loss and the WGAN-GP
//! objective: Wasserstein loss plus the gradient penalty computed on random
//! interpolations between real and generated images.

use tch::{Kind, Tensor};

/// Reconstruction loss: mean squared error over (C, H, W) per sample,
/// averaged over the batch
pub fn reconstruction_loss(y_true: &Tensor, y_pred: &Tensor) -> Tensor {
    (y_true - y_pred)
        .square()
        .mean_dim(Some([1i64, 2, 3].as_slice()), false, Kind::Float)
        .mean(Kind::Float)
}

/// Wasserstein loss: -E[y_true * y_pred]
///
/// With targets +1 for real and -1 for fake samples this yields the critic
/// objective E[D(G(z))] - E[D(x)] when summed over both terms.
pub fn wasserstein(y_true: &Tensor, y_pred: &Tensor) -> Tensor {
    -(y_true * y_pred).mean(Kind::Float)
}

/// Random convex combination of real and generated samples
///
/// One alpha ~ U(0, 1) per sample, broadcast over the image:
/// `alpha * real + (1 - alpha) * fake`.
pub fn random_weighted_average(real: &Tensor, fake: &Tensor) -> Tensor {
    let batch_size = real.size()[0];
    let alpha = Tensor::rand([batch_size, 1, 1, 1], (Kind::Float, real.device()));
    fake + &alpha * (real - fake)
}

/// Gradient penalty: E[(1 - ||dD(x_hat)/dx_hat||_2)^2]
///
/// `y_pred` must be the critic output computed from `interpolated_samples`,
/// which must require grad. The graph is kept so the penalty itself can be
/// backpropagated into the critic weights.
pub fn gradient_penalty_loss(y_pred: &Tensor, interpolated_samples: &Tensor) -> Tensor {
    let gradients = Tensor::run_backward(
        &[y_pred.sum(Kind::Float)],
        &[interpolated_samples],
        true,
        true,
    );
    let gradients = &gradients[0];

    let axes: Vec<i64> = (1..gradients.dim() as i64).collect();
    let gradient_l2_norm = gradients
        .square()
        .sum_dim_intlist(Some(axes.as_slice()), false, Kind::Float)
        .sqrt();

    (gradient_l2_norm - 1.0).square().mean(Kind::Float)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn test_reconstruction_loss() {
        let y_true = Tensor::zeros([2, 1, 2, 2], (Kind::Float, Device::Cpu));
        let y_pred = Tensor::from_slice(&[1.0f32, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0])
            .view([2, 1, 2, 2]);

        // Per-sample MSE is 1 and 4
        let loss = reconstruction_loss(&y_true, &y_pred);
        assert_eq!(loss.size(), Vec::<i64>::new());
        assert!((loss.double_value(&[]) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_reconstruction_loss_zero_for_identity() {
        let xs = Tensor::rand([3, 2, 4, 4], (Kind::Float, Device::Cpu));
        let loss = reconstruction_loss(&xs, &xs);
        assert_eq!(loss.double_value(&[]), 0.0);
    }

    #[test]
    fn test_wasserstein_signs() {
        let scores = Tensor::from_slice(&[1.0f32, 3.0]).view([2, 1]);
        let valid = Tensor::ones([2, 1], (Kind::Float, Device::Cpu));
        let fake = -Tensor::ones([2, 1], (Kind::Float, Device::Cpu));

        assert!((wasserstein(&valid, &scores).double_value(&[]) + 2.0).abs() < 1e-6);
        assert!((wasserstein(&fake, &scores).double_value(&[]) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_random_weighted_average_is_between_inputs() {
        let real = Tensor::ones([8, 1, 2, 2], (Kind::Float, Device::Cpu));
        let fake = -Tensor::ones([8, 1, 2, 2], (Kind::Float, Device::Cpu));

        let mixed = random_weighted_average(&real, &fake);
        assert_eq!(mixed.size(), vec![8, 1, 2, 2]);
        assert!(mixed.min().double_value(&[]) >= -1.0);
        assert!(mixed.max().double_value(&[]) <= 1.0);

        // Same alpha for every pixel of a sample
        let flat = mixed.view([8, 4]);
        let spread = (&flat - flat.narrow(1, 0, 1)).abs().max();
        assert!(spread.double_value(&[]) < 1e-6);
    }

    #[test]
    fn test_gradient_penalty_of_linear_critic() {
        // D(x) = sum(w * x): the gradient is w for every sample
        let w = Tensor::full([1, 2, 2], 0.5, (Kind::Float, Device::Cpu));
        let xs = Tensor::randn([4, 1, 2, 2], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let scores = (&xs * &w).sum_dim_intlist(Some([1i64, 2, 3].as_slice()), false, Kind::Float);

        // ||w|| = sqrt(4 * 0.25) = 1 -> no penalty
        let gp = gradient_penalty_loss(&scores, &xs);
        assert!(gp.double_value(&[]).abs() < 1e-6);

        let w = Tensor::full([1, 2, 2], 1.0, (Kind::Float, Device::Cpu));
        let scores = (&xs * &w).sum_dim_intlist(Some([1i64, 2, 3].as_slice()), false, Kind::Float);

        // ||w|| = 2 -> (1 - 2)^2 = 1
        let gp = gradient_penalty_loss(&scores, &xs);
        assert!((gp.double_value(&[]) - 1.0).abs() < 1e-5);
    }
}
