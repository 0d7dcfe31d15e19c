use tch::{nn, nn::OptimizerConfig, vision::dataset::Dataset, Kind, Tensor};
use tracing::{debug, info};

use super::{prepare_images, TrainConfig, VaeFlow};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub test_loss: f64,
}

/// Trains `model` with Adam on the train split of `dataset` and reports the
/// mean loss on both splits after every epoch.
pub fn fit(vs: &nn::VarStore, model: &VaeFlow, dataset: &Dataset, cfg: &TrainConfig) -> Result<Vec<EpochStats>> {
    let n_train = dataset.train_images.size().first().copied().unwrap_or(0);
    if n_train < cfg.b_size {
        return Err(Error::InvalidInput(format!(
            "train split has {n_train} images, fewer than one batch of {}",
            cfg.b_size
        )));
    }
    let mut opt = nn::Adam::default().build(vs, cfg.lr)?;
    let in_channels = model.config.in_channels;
    let img_size = model.config.img_size;
    let mut history = Vec::with_capacity(cfg.n_epochs);
    for epoch in 1..=cfg.n_epochs {
        let mut sum_loss = 0.;
        let mut n_batches = 0usize;
        for (bimages, _) in dataset.train_iter(cfg.b_size).shuffle().to_device(vs.device()) {
            let xs = prepare_images(&bimages, in_channels, img_size)?;
            let out = model.forward_t(&xs, true);
            let loss = model.loss(&xs, &out);
            let value = loss.total.double_value(&[]);
            if !value.is_finite() {
                return Err(Error::NonFiniteLoss { epoch });
            }
            opt.backward_step(&loss.total);
            debug!(
                epoch,
                batch = n_batches,
                loss = value,
                recon = loss.recon.double_value(&[]),
                kl = loss.kl.double_value(&[]),
                posterior_kl = out.posterior.kl_to_standard().mean(Kind::Float).double_value(&[]),
                "train step"
            );
            sum_loss += value;
            n_batches += 1;
        }
        let train_loss = sum_loss / n_batches as f64;
        let test_loss = evaluate(model, &dataset.test_images, cfg.b_size)?;
        info!(epoch, n_epochs = cfg.n_epochs, train_loss, test_loss, "epoch done");
        history.push(EpochStats { epoch, train_loss, test_loss });
    }
    Ok(history)
}

/// Mean per-sample loss over `images`, with batch-norm in eval mode.
pub fn evaluate(model: &VaeFlow, images: &Tensor, b_size: i64) -> Result<f64> {
    let _no_grad_guard = tch::no_grad_guard();
    let n = images.size().first().copied().unwrap_or(0);
    if n == 0 {
        return Ok(f64::NAN);
    }
    let device = model.device();
    let mut sum_loss = 0.;
    let mut start = 0;
    while start < n {
        let len = b_size.min(n - start);
        let bimages = images.narrow(0, start, len).to_device(device);
        let xs = prepare_images(&bimages, model.config.in_channels, model.config.img_size)?;
        let out = model.forward_t(&xs, false);
        let loss = model.loss(&xs, &out).total.to_kind(Kind::Double).double_value(&[]);
        sum_loss += loss * len as f64;
        start += len;
    }
    Ok(sum_loss / n as f64)
}
