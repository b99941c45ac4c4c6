//! Horizontal image strip shown to the merge synthesis call.

use std::io::Cursor;

use anyhow::Context;
use base64::Engine;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use super::traits::EncodedImage;

pub const DEFAULT_STRIP_HEIGHT: u32 = 300;

/// Decode, resize every image to `height` keeping its aspect ratio, paste
/// left to right on a white canvas and re-encode as base64 JPEG.
pub fn concat_horizontally(images: &[&EncodedImage], height: Option<u32>) -> anyhow::Result<EncodedImage> {
    let height = height.unwrap_or(DEFAULT_STRIP_HEIGHT).max(1);
    anyhow::ensure!(!images.is_empty(), "no images to concatenate");

    let mut resized = Vec::with_capacity(images.len());
    for (index, encoded) in images.iter().enumerate() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_str())
            .with_context(|| format!("image {index} is not valid base64"))?;
        let img = image::load_from_memory(&bytes)
            .with_context(|| format!("image {index} could not be decoded"))?
            .to_rgb8();
        let (w, h) = img.dimensions();
        let scaled_w = ((f64::from(w) * f64::from(height) / f64::from(h.max(1))).round() as u32).max(1);
        resized.push(imageops::resize(&img, scaled_w, height, FilterType::Triangle));
    }

    let total_w: u32 = resized.iter().map(|img| img.width()).sum();
    let max_h = resized.iter().map(|img| img.height()).max().unwrap_or(height);
    let mut canvas = RgbImage::from_pixel(total_w, max_h, Rgb([255, 255, 255]));
    let mut x: i64 = 0;
    for img in &resized {
        imageops::overlay(&mut canvas, img, x, 0);
        x += i64::from(img.width());
    }

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut out, ImageFormat::Jpeg)
        .context("encoding composite strip")?;
    Ok(EncodedImage::new(
        base64::engine::general_purpose::STANDARD.encode(out.into_inner()),
    ))
}

/// [`concat_horizontally`] on the blocking pool, keeping the decode and
/// resize work off the async workers.
pub async fn render_strip(images: Vec<EncodedImage>, height: Option<u32>) -> anyhow::Result<EncodedImage> {
    tokio::task::spawn_blocking(move || {
        let refs: Vec<&EncodedImage> = images.iter().collect();
        concat_horizontally(&refs, height)
    })
    .await
    .context("composite task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(w: u32, h: u32) -> EncodedImage {
        let img = RgbImage::from_pixel(w, h, Rgb([10, 120, 200]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        EncodedImage::new(base64::engine::general_purpose::STANDARD.encode(buf.into_inner()))
    }

    fn decode(img: &EncodedImage) -> DynamicImage {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(img.as_str())
            .unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    #[test]
    fn strip_width_is_sum_of_scaled_widths() {
        let a = png(20, 10);
        let b = png(10, 30);
        let strip = concat_horizontally(&[&a, &b], None).unwrap();
        let decoded = decode(&strip);
        assert_eq!(decoded.width(), 600 + 100);
        assert_eq!(decoded.height(), 300);
    }

    #[test]
    fn custom_height_is_honoured() {
        let a = png(8, 8);
        let strip = concat_horizontally(&[&a], Some(16)).unwrap();
        let decoded = decode(&strip);
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[test]
    fn garbage_input_is_an_error() {
        let bad = EncodedImage::new("not an image");
        assert!(concat_horizontally(&[&bad], None).is_err());
        assert!(concat_horizontally(&[], None).is_err());
    }

    #[tokio::test]
    async fn strip_renders_on_blocking_pool() {
        let strip = render_strip(vec![png(8, 8), png(8, 8)], Some(16)).await.unwrap();
        let decoded = decode(&strip);
        assert_eq!((decoded.width(), decoded.height()), (32, 16));

        let err = render_strip(vec![EncodedImage::new("not an image")], None).await;
        assert!(err.is_err());
    }
}
