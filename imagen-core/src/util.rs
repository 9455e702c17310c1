use anyhow::Result;
use candle_core::Tensor;
use image::DynamicImage;

/// Converts a (3, height, width) u8 tensor into an RGB raster image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn tensor_round_trips_to_an_rgb_image() {
        // 2x2 raster, one channel plane at a time.
        let data: Vec<u8> = vec![
            10, 20, 30, 40, // R
            50, 60, 70, 80, // G
            90, 100, 110, 120, // B
        ];
        let tensor = Tensor::from_vec(data, (3, 2, 2), &Device::Cpu).unwrap();
        let image = tensor_to_image(&tensor).unwrap();
        let rgb = image.to_rgb8();
        assert_eq!(rgb.dimensions(), (2, 2));
        assert_eq!(rgb.get_pixel(0, 0).0, [10, 50, 90]);
        assert_eq!(rgb.get_pixel(1, 1).0, [40, 80, 120]);
    }

    #[test]
    fn non_rgb_tensor_is_rejected() {
        let tensor = Tensor::zeros((4, 2, 2), candle_core::DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }
}
