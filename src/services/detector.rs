use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};

use crate::models::job::BoundingBox;

/// Outcome of running face detection on one image.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub boxes: Vec<BoundingBox>,
    /// PNG of the input with every box outlined; present iff `boxes` is not empty.
    pub annotated: Option<Vec<u8>>,
}

impl Detection {
    pub fn has_faces(&self) -> bool {
        !self.boxes.is_empty()
    }
}

/// Face detection capability. Implementations are CPU-bound and synchronous;
/// the worker calls them from the blocking thread pool.
pub trait Detector: Send + Sync {
    fn detect(&self, image_bytes: &[u8]) -> Result<Detection, DetectorError>;
}

/// Extension of the annotated images a [`Detector`] produces.
pub const ANNOTATED_EXTENSION: &str = "png";

/// Skin-colour segmentation detector.
///
/// Pixels are classified as skin in YCbCr space, grouped into 4-connected
/// regions, and regions are kept as faces when they are large enough, roughly
/// face-shaped and mostly filled.
#[derive(Debug, Clone)]
pub struct SkinToneDetector {
    pub min_size: u32,
    pub min_aspect: f32,
    pub max_aspect: f32,
    pub min_fill: f32,
    pub outline: Rgb<u8>,
    pub outline_width: u32,
}

impl Default for SkinToneDetector {
    fn default() -> Self {
        Self {
            min_size: 30,
            min_aspect: 0.4,
            max_aspect: 1.6,
            min_fill: 0.45,
            outline: Rgb([0, 0, 255]),
            outline_width: 2,
        }
    }
}

fn is_skin(Rgb([r, g, b]): Rgb<u8>) -> bool {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}

struct Region {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    pixels: u64,
}

impl SkinToneDetector {
    fn regions(&self, img: &RgbImage) -> Vec<Region> {
        let (width, height) = img.dimensions();
        let mut mask: Vec<bool> = img.pixels().map(|p| is_skin(*p)).collect();
        let mut regions = Vec::new();
        let mut stack = Vec::new();

        for start in 0..mask.len() {
            if !mask[start] {
                continue;
            }
            mask[start] = false;
            stack.push(start);

            let (x0, y0) = ((start as u32) % width, (start as u32) / width);
            let mut region = Region {
                min_x: x0,
                min_y: y0,
                max_x: x0,
                max_y: y0,
                pixels: 0,
            };

            while let Some(idx) = stack.pop() {
                let (x, y) = ((idx as u32) % width, (idx as u32) / width);
                region.pixels += 1;
                region.min_x = region.min_x.min(x);
                region.max_x = region.max_x.max(x);
                region.min_y = region.min_y.min(y);
                region.max_y = region.max_y.max(y);

                let mut visit = |nx: u32, ny: u32| {
                    let n = (ny * width + nx) as usize;
                    if mask[n] {
                        mask[n] = false;
                        stack.push(n);
                    }
                };
                if x > 0 {
                    visit(x - 1, y);
                }
                if x + 1 < width {
                    visit(x + 1, y);
                }
                if y > 0 {
                    visit(x, y - 1);
                }
                if y + 1 < height {
                    visit(x, y + 1);
                }
            }

            regions.push(region);
        }

        regions
    }

    fn to_face(&self, region: &Region) -> Option<BoundingBox> {
        let w = region.max_x - region.min_x + 1;
        let h = region.max_y - region.min_y + 1;
        if w < self.min_size || h < self.min_size {
            return None;
        }

        let aspect = w as f32 / h as f32;
        let fill = region.pixels as f32 / (w as f32 * h as f32);
        if aspect < self.min_aspect || aspect > self.max_aspect || fill < self.min_fill {
            return None;
        }

        Some(BoundingBox::new(
            region.min_x as i32,
            region.min_y as i32,
            w as i32,
            h as i32,
        ))
    }

    fn draw_outline(&self, img: &mut RgbImage, b: &BoundingBox) {
        let (width, height) = img.dimensions();
        let (x0, y0) = (b.x as u32, b.y as u32);
        let x1 = (x0 + b.w as u32).min(width) - 1;
        let y1 = (y0 + b.h as u32).min(height) - 1;

        for t in 0..self.outline_width {
            for x in x0..=x1 {
                if y0 + t <= y1 {
                    img.put_pixel(x, y0 + t, self.outline);
                }
                if y1 >= y0 + t {
                    img.put_pixel(x, y1 - t, self.outline);
                }
            }
            for y in y0..=y1 {
                if x0 + t <= x1 {
                    img.put_pixel(x0 + t, y, self.outline);
                }
                if x1 >= x0 + t {
                    img.put_pixel(x1 - t, y, self.outline);
                }
            }
        }
    }
}

impl Detector for SkinToneDetector {
    fn detect(&self, image_bytes: &[u8]) -> Result<Detection, DetectorError> {
        let mut img = image::load_from_memory(image_bytes)
            .map_err(DetectorError::InvalidImage)?
            .to_rgb8();

        let mut boxes: Vec<BoundingBox> = self
            .regions(&img)
            .iter()
            .filter_map(|r| self.to_face(r))
            .collect();
        boxes.sort_by_key(|b| (b.y, b.x));

        if boxes.is_empty() {
            return Ok(Detection::default());
        }

        for b in &boxes {
            self.draw_outline(&mut img, b);
        }

        let mut annotated = Vec::new();
        img.write_to(&mut Cursor::new(&mut annotated), ImageFormat::Png)
            .map_err(DetectorError::Encode)?;

        Ok(Detection {
            boxes,
            annotated: Some(annotated),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Image could not be decoded: {0}")]
    InvalidImage(image::ImageError),

    #[error("Annotated image could not be encoded: {0}")]
    Encode(image::ImageError),
}

impl DetectorError {
    /// Failures caused by the input itself; retrying cannot help.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DetectorError::InvalidImage(_))
    }
}
