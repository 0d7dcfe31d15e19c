use std::path::{Path, PathBuf};

use tch::{Device, Kind, Tensor};

use crate::error::{Error, Result};

pub fn get_device(cpu: bool) -> Device {
    if cpu {
        return Device::Cpu;
    }
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

/// Path of the `snapshot_idx`-th intermediary image saved next to `final_image`,
/// e.g. `out/final.png` -> `out/final-3.png`. Extension-less names get `.png`.
pub fn output_filename<T: AsRef<Path>>(final_image: T, snapshot_idx: usize) -> PathBuf {
    let final_image = final_image.as_ref();
    let stem = final_image.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let extension = final_image.extension().map(|e| e.to_string_lossy()).unwrap_or("png".into());
    final_image.with_file_name(format!("{stem}-{snapshot_idx}.{extension}"))
}

pub fn has_nan(xs: &Tensor) -> bool {
    xs.isnan().any().int64_value(&[]) != 0
}

/// Tiles a `[b, c, h, w]` batch into a single `[c, rows * h, ncols * w]` image,
/// padding the last row with zeros.
pub fn image_grid(images: &Tensor, ncols: i64) -> Result<Tensor> {
    let (bsize, channels, height, width) = images.size4()?;
    if bsize == 0 {
        return Err(Error::InvalidInput("cannot build a grid from an empty batch".to_string()));
    }
    let ncols = ncols.clamp(1, bsize);
    let nrows = (bsize + ncols - 1) / ncols;
    let pad = nrows * ncols - bsize;
    let images = if pad > 0 {
        let padding = Tensor::zeros([pad, channels, height, width], (images.kind(), images.device()));
        Tensor::cat(&[images.shallow_clone(), padding], 0)
    } else {
        images.shallow_clone()
    };
    let grid = images
        .reshape([nrows, ncols, channels, height, width])
        .permute([2, 0, 3, 1, 4])
        .reshape([channels, nrows * height, ncols * width]);
    Ok(grid)
}

/// Maps values from `[-1, 1]` to `u8` pixels.
pub fn to_pixels(xs: &Tensor) -> Tensor {
    ((xs / 2 + 0.5).clamp(0., 1.) * 255.).to_kind(Kind::Uint8)
}

pub fn save_image_grid<T: AsRef<Path>>(images: &Tensor, path: T) -> Result<()> {
    let images = images.to_device(Device::Cpu);
    let bsize = images.size().first().copied().unwrap_or(0);
    let ncols = (bsize as f64).sqrt().ceil() as i64;
    let grid = image_grid(&images, ncols)?;
    tch::vision::image::save(&to_pixels(&grid), path)?;
    Ok(())
}
