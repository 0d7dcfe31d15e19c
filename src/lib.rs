pub mod error;
pub mod langevin;
pub mod schedulers;
pub mod unet;
pub mod utils;
pub mod vae;

pub use error::{Error, Result};
