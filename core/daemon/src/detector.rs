//! Frame classification: decode, locate faces, apply the centering rule.
//!
//! Face location sits behind [`FaceLocator`] so a heavier detector can be
//! swapped in without touching the classification rule. The bundled
//! [`SkinToneLocator`] is a crude YCbCr skin segmenter that is good enough
//! for a single user sitting in front of a webcam.

use image::RgbImage;
use posture_daemon_protocol::PostureStatus;

use crate::config::DetectorConfig;
use crate::error::DetectError;

/// Fraction of the frame height a column must cover in skin pixels to be
/// considered part of a face region.
const MIN_COLUMN_COVERAGE: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    pub fn center_x(&self) -> u32 {
        self.x + self.width / 2
    }
}

pub trait FaceLocator: Send + Sync {
    fn locate(&self, frame: &RgbImage) -> Vec<FaceBox>;
}

pub struct Detector {
    locator: Box<dyn FaceLocator>,
    center_tolerance_px: u32,
}

impl Detector {
    pub fn new(locator: Box<dyn FaceLocator>, center_tolerance_px: u32) -> Self {
        Self {
            locator,
            center_tolerance_px,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(
            Box::new(SkinToneLocator::new(config.min_face_pixels)),
            config.center_tolerance_px,
        )
    }

    pub fn classify(&self, bytes: &[u8]) -> Result<PostureStatus, DetectError> {
        if bytes.is_empty() {
            return Err(DetectError::EmptyPayload);
        }
        let frame = image::load_from_memory(bytes)?.to_rgb8();
        Ok(self.classify_frame(&frame))
    }

    pub fn classify_frame(&self, frame: &RgbImage) -> PostureStatus {
        let faces = self.locator.locate(frame);
        if faces.is_empty() {
            tracing::debug!("No face located in frame");
            return PostureStatus::Bad;
        }

        let frame_center_x = frame.width() / 2;
        for face in &faces {
            let deviation = face.center_x().abs_diff(frame_center_x);
            if deviation > self.center_tolerance_px {
                tracing::debug!(
                    face_center_x = face.center_x(),
                    face_top = face.y,
                    face_height = face.height,
                    frame_center_x,
                    deviation,
                    "Face off-center"
                );
                return PostureStatus::Bad;
            }
        }

        PostureStatus::Good
    }
}

/// Locates faces as runs of columns dense in skin-toned pixels.
pub struct SkinToneLocator {
    min_face_pixels: u32,
}

impl SkinToneLocator {
    pub fn new(min_face_pixels: u32) -> Self {
        Self { min_face_pixels }
    }
}

impl FaceLocator for SkinToneLocator {
    fn locate(&self, frame: &RgbImage) -> Vec<FaceBox> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let mut column_counts = vec![0u32; width as usize];
        let mut column_top = vec![u32::MAX; width as usize];
        let mut column_bottom = vec![0u32; width as usize];
        for (x, y, pixel) in frame.enumerate_pixels() {
            if is_skin(pixel.0) {
                let col = x as usize;
                column_counts[col] += 1;
                column_top[col] = column_top[col].min(y);
                column_bottom[col] = column_bottom[col].max(y);
            }
        }

        let min_column = ((height as f32 * MIN_COLUMN_COVERAGE) as u32).max(1);
        let mut faces = Vec::new();
        let mut run_start: Option<usize> = None;

        for col in 0..=column_counts.len() {
            let active = column_counts
                .get(col)
                .map(|count| *count >= min_column)
                .unwrap_or(false);
            match (active, run_start) {
                (true, None) => run_start = Some(col),
                (false, Some(start)) => {
                    let span = start..col;
                    let mass: u32 = column_counts[span.clone()].iter().sum();
                    if mass >= self.min_face_pixels {
                        let top = column_top[span.clone()].iter().copied().min().unwrap_or(0);
                        let bottom = column_bottom[span].iter().copied().max().unwrap_or(top);
                        faces.push(FaceBox {
                            x: start as u32,
                            y: top,
                            width: (col - start) as u32,
                            height: bottom.saturating_sub(top) + 1,
                        });
                    }
                    run_start = None;
                }
                _ => {}
            }
        }

        faces
    }
}

fn is_skin([r, g, b]: [u8; 3]) -> bool {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    y > 40.0 && (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}
