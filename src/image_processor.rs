//! Image ingestion: any supported raw image to canonical 8-bit RGB.

use image::{DynamicImage, ImageBuffer, Pixel, RgbImage};
use ndarray::prelude::*;

use crate::errors::{Result, SegError};
use crate::imageops_ai::convert_color::{to_rgb, Sample};

/// Canonical 8-bit RGB copy of `image`.
///
/// Grayscale is replicated to three channels, alpha is composited over white
/// and wider samples are reduced to 8 bits. Empty images are rejected.
pub fn normalize(image: &DynamicImage) -> Result<RgbImage> {
    match image {
        DynamicImage::ImageLuma8(buffer) => from_buffer(buffer),
        DynamicImage::ImageLumaA8(buffer) => from_buffer(buffer),
        DynamicImage::ImageRgb8(buffer) => from_buffer(buffer),
        DynamicImage::ImageRgba8(buffer) => from_buffer(buffer),
        DynamicImage::ImageLuma16(buffer) => from_buffer(buffer),
        DynamicImage::ImageLumaA16(buffer) => from_buffer(buffer),
        DynamicImage::ImageRgb16(buffer) => from_buffer(buffer),
        DynamicImage::ImageRgba16(buffer) => from_buffer(buffer),
        DynamicImage::ImageRgb32F(buffer) => from_buffer(buffer),
        DynamicImage::ImageRgba32F(buffer) => from_buffer(buffer),
        other => Err(SegError::InvalidImageShape {
            shape: vec![
                other.height() as usize,
                other.width() as usize,
                other.color().channel_count() as usize,
            ],
        }),
    }
}

/// Canonical 8-bit RGB image from a raw `(H, W)`, `(H, W, 3)` or `(H, W, 4)`
/// array.
pub fn normalize_array<S: Sample>(array: ArrayViewD<'_, S>) -> Result<RgbImage> {
    let invalid = || SegError::InvalidImageShape {
        shape: array.shape().to_vec(),
    };
    let pixels = match array.shape() {
        [_, _] => array
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| invalid())?
            .insert_axis(Axis(2)),
        [_, _, 3] | [_, _, 4] => array
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };
    from_pixels(pixels)
}

fn from_buffer<P, S>(buffer: &ImageBuffer<P, Vec<S>>) -> Result<RgbImage>
where
    P: Pixel<Subpixel = S>,
    S: Sample + image::Primitive,
{
    let (width, height) = buffer.dimensions();
    let shape = (
        height as usize,
        width as usize,
        P::CHANNEL_COUNT as usize,
    );
    let pixels = ArrayView3::from_shape(shape, buffer.as_raw().as_slice())?;
    from_pixels(pixels)
}

fn from_pixels<S: Sample>(pixels: ArrayView3<'_, S>) -> Result<RgbImage> {
    let (height, width, channels) = pixels.dim();
    if height == 0 || width == 0 || !(1..=4).contains(&channels) {
        return Err(SegError::InvalidImageShape {
            shape: vec![height, width, channels],
        });
    }
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        to_rgb(pixels.slice(s![y as usize, x as usize, ..]))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, LumaA, Rgb, Rgba, RgbaImage};

    #[test]
    fn rgb8_passes_through() -> Result<()> {
        let image = RgbImage::from_pixel(3, 2, Rgb([1, 2, 3]));
        let canonical = normalize(&DynamicImage::ImageRgb8(image.clone()))?;
        assert_eq!(canonical, image);
        Ok(())
    }

    #[test]
    fn grayscale_is_replicated() -> Result<()> {
        let image = GrayImage::from_pixel(4, 4, Luma([77]));
        let canonical = normalize(&DynamicImage::ImageLuma8(image))?;
        assert_eq!(canonical.dimensions(), (4, 4));
        assert_eq!(canonical.get_pixel(2, 3), &Rgb([77, 77, 77]));
        Ok(())
    }

    #[test]
    fn rgba_is_flattened_on_white() -> Result<()> {
        let mut image = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 0]));
        image.put_pixel(1, 0, Rgba([50, 60, 70, 255]));
        let canonical = normalize(&DynamicImage::ImageRgba8(image))?;
        assert_eq!(canonical.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(canonical.get_pixel(1, 0), &Rgb([50, 60, 70]));
        Ok(())
    }

    #[test]
    fn sixteen_bit_is_reduced() -> Result<()> {
        let image = ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(1, 1, Luma([0xABCD]));
        let canonical = normalize(&DynamicImage::ImageLuma16(image))?;
        assert_eq!(canonical.get_pixel(0, 0), &Rgb([0xAB, 0xAB, 0xAB]));

        let image = ImageBuffer::<LumaA<u16>, Vec<u16>>::from_pixel(1, 1, LumaA([0, 65535]));
        let canonical = normalize(&DynamicImage::ImageLumaA16(image))?;
        assert_eq!(canonical.get_pixel(0, 0), &Rgb([0, 0, 0]));
        Ok(())
    }

    #[test]
    fn empty_image_is_rejected() {
        let result = normalize(&DynamicImage::ImageRgb8(RgbImage::new(0, 5)));
        assert!(matches!(result, Err(SegError::InvalidImageShape { .. })));
    }

    #[test]
    fn arrays_of_supported_shapes() -> Result<()> {
        let gray = Array2::<f32>::from_elem((2, 3), 1.0);
        let canonical = normalize_array(gray.view().into_dyn())?;
        assert_eq!(canonical.dimensions(), (3, 2));
        assert_eq!(canonical.get_pixel(0, 0), &Rgb([255, 255, 255]));

        let rgba = Array3::<u8>::from_elem((2, 2, 4), 255);
        assert!(normalize_array(rgba.view().into_dyn()).is_ok());
        Ok(())
    }

    #[test]
    fn arrays_of_unsupported_shapes() {
        let volume = Array4::<u8>::zeros((2, 2, 2, 3));
        let err = normalize_array(volume.view().into_dyn()).unwrap_err();
        assert!(matches!(err, SegError::InvalidImageShape { ref shape } if shape == &vec![2, 2, 2, 3]));

        let two_channel = Array3::<u8>::zeros((4, 4, 2));
        assert!(normalize_array(two_channel.view().into_dyn()).is_err());

        let line = Array1::<u8>::zeros(8);
        assert!(normalize_array(line.view().into_dyn()).is_err());
    }
}
