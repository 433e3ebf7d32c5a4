use anyhow::{Context, Result};
use image::GenericImageView;
use serde::Serialize;

use crate::expert::backend::Expert;
use crate::expert::output::ExpertOutput;
use crate::frame::Frame;

/// Decodes the frame and reports its dimensions and mean luminance.
///
/// Frames of any resolution are accepted; the processing scale applied by the
/// capture side simply shows up in the reported dimensions.
pub struct LumaExpert {
    name: String,
}

#[derive(Serialize)]
struct LumaReport {
    width: u32,
    height: u32,
    mean_luma: f32,
}

impl LumaExpert {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Expert for LumaExpert {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, frame: &Frame) -> Result<ExpertOutput> {
        let image = image::load_from_memory(frame.payload()).context("decode frame")?;
        let (width, height) = image.dimensions();
        let luma = image.into_luma8();
        let pixels = luma.as_raw();
        let mean_luma = if pixels.is_empty() {
            0.0
        } else {
            pixels.iter().map(|&p| p as u64).sum::<u64>() as f32 / pixels.len() as f32
        };
        ExpertOutput::json(&LumaReport {
            width,
            height,
            mean_luma,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CameraId;
    use image::{ImageBuffer, ImageFormat, Luma};
    use std::io::Cursor;
    use std::time::SystemTime;

    fn png(width: u32, height: u32, value: u8) -> Vec<u8> {
        let img: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_pixel(width, height, Luma([value]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn tolerates_varying_resolution() {
        let expert = LumaExpert::new("luma");
        let cam = CameraId::new("cam0").unwrap();
        for (w, h) in [(64, 48), (320, 240), (17, 3)] {
            let frame = Frame::new(cam.clone(), png(w, h, 200), SystemTime::now());
            let out = expert.invoke(&frame).unwrap();
            assert_eq!(out.value()["width"], w);
            assert_eq!(out.value()["height"], h);
            assert_eq!(out.value()["mean_luma"], 200.0);
        }
    }

    #[test]
    fn garbage_payload_is_an_error() {
        let expert = LumaExpert::new("luma");
        let frame = Frame::new(CameraId::new("cam0").unwrap(), vec![1, 2, 3], SystemTime::now());
        assert!(expert.invoke(&frame).is_err());
    }
}
