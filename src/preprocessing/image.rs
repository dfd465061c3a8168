//! Image decoding, resizing and channel normalization

use super::{PreparedTensor, PreprocessingAdapter};
use crate::error::{DiagnosticError, Result};
use crate::models::descriptor::{ImageLayout, ImageSpec, InputShape, ModelDescriptor, PreprocessingSpec};
use crate::types::request::DiagnosticRequest;
use ::image::imageops::FilterType;
use tracing::debug;

/// Adapter for chest X-ray and skin lesion models.
///
/// Decode, resize to the descriptor shape with a fixed triangle filter, then
/// map pixels through `(p * scale - mean[c]) / std[c]`. No augmentation.
pub struct ImageAdapter;

impl ImageAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Turn encoded image bytes into a tensor of `shape`
    pub fn prepare_bytes(&self, bytes: &[u8], spec: &ImageSpec, shape: &InputShape) -> Result<PreparedTensor> {
        let (height, width, channels) = spec.dims(shape).ok_or_else(|| {
            DiagnosticError::UnsupportedFormat(format!("shape {shape} is not an image shape"))
        })?;
        let (target_w, target_h) = match (u32::try_from(width), u32::try_from(height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => {
                return Err(DiagnosticError::UnsupportedFormat(format!(
                    "image shape {shape} is too large"
                )))
            }
        };

        let decoded = ::image::load_from_memory(bytes)
            .map_err(|e| DiagnosticError::UnsupportedFormat(format!("failed to decode image: {e}")))?;
        debug!(
            width = decoded.width(),
            height = decoded.height(),
            source_channels = decoded.color().channel_count(),
            target_channels = channels,
            "Decoded image"
        );

        let resized = decoded.resize_exact(target_w, target_h, FilterType::Triangle);
        let pixels = match channels {
            1 => resized.to_luma8().into_raw(),
            3 => resized.to_rgb8().into_raw(),
            4 => resized.to_rgba8().into_raw(),
            other => {
                return Err(DiagnosticError::UnsupportedFormat(format!(
                    "cannot convert image to {other} channels"
                )))
            }
        };

        let data = normalize(&pixels, spec, height, width, channels);
        PreparedTensor::new(data, shape.clone())
    }
}

/// Interleaved HWC bytes to normalized floats in the model's layout
fn normalize(pixels: &[u8], spec: &ImageSpec, height: usize, width: usize, channels: usize) -> Vec<f32> {
    let plane = height * width;
    let mut data = vec![0.0_f32; plane * channels];

    for (i, &p) in pixels.iter().enumerate() {
        let c = i % channels;
        let value = (f32::from(p) * spec.scale - spec.mean_for(c)) / spec.std_for(c);
        let index = match spec.layout {
            ImageLayout::Nhwc => i,
            ImageLayout::Nchw => c * plane + i / channels,
        };
        data[index] = value;
    }
    data
}

impl Default for ImageAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PreprocessingAdapter for ImageAdapter {
    fn prepare(&self, request: &DiagnosticRequest, descriptor: &ModelDescriptor) -> Result<PreparedTensor> {
        match (request, &descriptor.preprocessing) {
            (DiagnosticRequest::Image(req), PreprocessingSpec::Image(spec)) => {
                self.prepare_bytes(&req.bytes, spec, &descriptor.input_shape)
            }
            (DiagnosticRequest::Symptom(_), _) => Err(DiagnosticError::UnsupportedFormat(format!(
                "model `{}` expects an image, got a symptom set",
                descriptor.id
            ))),
            (_, spec) => Err(DiagnosticError::UnsupportedFormat(format!(
                "model `{}` uses `{}` preprocessing, not image",
                descriptor.id,
                spec.key()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::descriptor::fixtures::image_descriptor;
    use crate::types::request::TaskType;
    use ::image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_grayscale_resize_and_scale() {
        let desc = image_descriptor("xr", &["normal", "pneumonia"], [4, 4, 1]);
        let req = DiagnosticRequest::image(TaskType::ChestXray, png(16, 8, [255, 255, 255]));

        let tensor = ImageAdapter.prepare(&req, &desc).unwrap();

        assert_eq!(tensor.shape(), &desc.input_shape);
        assert_eq!(tensor.data().len(), 16);
        assert!(tensor.data().iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_rgb_mean_std_nchw() {
        let mut desc = image_descriptor("skin", &["benign", "malignant"], [3, 2, 2]);
        desc.task_type = TaskType::SkinLesion;
        desc.preprocessing = PreprocessingSpec::Image(ImageSpec {
            layout: ImageLayout::Nchw,
            channels: 3,
            scale: 1.0 / 255.0,
            mean: vec![0.5, 0.5, 0.5],
            std: vec![0.5, 0.5, 0.5],
        });
        let req = DiagnosticRequest::image(TaskType::SkinLesion, png(2, 2, [255, 0, 255]));

        let tensor = ImageAdapter.prepare(&req, &desc).unwrap();
        let data = tensor.data();

        // red plane, green plane, blue plane
        assert!(data[0..4].iter().all(|v| (v - 1.0).abs() < 1e-5));
        assert!(data[4..8].iter().all(|v| (v + 1.0).abs() < 1e-5));
        assert!(data[8..12].iter().all(|v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_preprocessing_is_deterministic() {
        let desc = image_descriptor("xr", &["normal", "pneumonia"], [3, 3, 1]);
        let req = DiagnosticRequest::image(TaskType::ChestXray, png(7, 5, [10, 120, 200]));

        let a = ImageAdapter.prepare(&req, &desc).unwrap();
        let b = ImageAdapter.prepare(&req, &desc).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_undecodable_bytes_rejected() {
        let desc = image_descriptor("xr", &["normal", "pneumonia"], [4, 4, 1]);
        let req = DiagnosticRequest::image(TaskType::ChestXray, b"definitely not a png".to_vec());

        let err = ImageAdapter.prepare(&req, &desc).unwrap_err();
        assert!(matches!(err, DiagnosticError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_empty_buffer_is_undecodable() {
        let desc = image_descriptor("xr", &["normal", "pneumonia"], [4, 4, 1]);
        let req = DiagnosticRequest::image(TaskType::ChestXray, Vec::new());

        let err = ImageAdapter.prepare(&req, &desc).unwrap_err();
        assert!(matches!(err, DiagnosticError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_unsupported_channel_count() {
        let mut desc = image_descriptor("xr", &["normal", "pneumonia"], [4, 4, 2]);
        if let PreprocessingSpec::Image(spec) = &mut desc.preprocessing {
            spec.channels = 2;
        }
        let req = DiagnosticRequest::image(TaskType::ChestXray, png(4, 4, [0, 0, 0]));

        let err = ImageAdapter.prepare(&req, &desc).unwrap_err();
        assert!(matches!(err, DiagnosticError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_symptom_request_rejected_by_image_adapter() {
        let desc = image_descriptor("xr", &["normal", "pneumonia"], [4, 4, 1]);
        let req = DiagnosticRequest::symptoms(["fever"]);

        assert!(ImageAdapter.prepare(&req, &desc).is_err());
    }
}
