use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use image::{DynamicImage, ImageFormat};
use tracing::info;

use crate::{CaptionFailure, DeviceMap};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                info!("no accelerator available, running on CPU; build with `--features metal` for GPU");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                info!("no accelerator available, running on CPU; build with `--features cuda` for GPU");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Decodes an uploaded JPEG or PNG into a three-channel image.
///
/// The result lives for one captioning request only; nothing is persisted.
pub fn decode_upload(bytes: &[u8]) -> Result<DynamicImage, CaptionFailure> {
    if bytes.is_empty() {
        return Err(CaptionFailure::InvalidImage("no image data in upload".into()));
    }
    let format =
        image::guess_format(bytes).map_err(|e| CaptionFailure::InvalidImage(e.to_string()))?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
        return Err(CaptionFailure::InvalidImage(format!(
            "unsupported upload format {format:?}, expected JPEG or PNG"
        )));
    }
    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| CaptionFailure::InvalidImage(e.to_string()))?;
    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}
