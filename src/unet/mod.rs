//! # Score UNet
//!
//! Residual, attention and sampling blocks assembled into a UNet that
//! estimates the score of noisy images, conditioned on the noise level.
pub mod attention;
pub mod blocks;
pub mod embeddings;
pub mod resnet;
pub mod unet_2d;

pub use self::unet_2d::{ScoreUNet, ScoreUNetConfig};
