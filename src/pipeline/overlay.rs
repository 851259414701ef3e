//! Drawing of detection annotations onto frames.

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use ndarray::Array2;
use tracing::warn;

use crate::engine::BoundingBox;
use crate::RenderConfig;

const BOX_THICKNESS: i32 = 4;
const LABEL_SCALE: f32 = 18.0;
const MASK_COVERED: f32 = 0.5;

pub(crate) struct Overlay {
    font: Option<FontVec>,
    mask_alpha: f32,
    fps_badge_alpha: f32,
}

impl Overlay {
    pub fn new(cfg: &RenderConfig) -> Self {
        let font = cfg.font_path.as_ref().and_then(|path| {
            match std::fs::read(path).map(FontVec::try_from_vec) {
                Ok(Ok(font)) => Some(font),
                Ok(Err(e)) => {
                    warn!("label font unusable, boxes drawn without text: {e}");
                    None
                }
                Err(e) => {
                    warn!(path = %path.display(), "label font unreadable: {e}");
                    None
                }
            }
        });
        Self {
            font,
            mask_alpha: cfg.mask_alpha,
            fps_badge_alpha: cfg.fps_badge_alpha,
        }
    }

    /// Blend a segmentation mask into the frame as a translucent red layer.
    pub fn blend_mask(&self, canvas: &mut RgbImage, mask: &Array2<f32>) {
        let (height, width) = mask.dim();
        let a = self.mask_alpha;
        for y in 0..height.min(canvas.height() as usize) {
            for x in 0..width.min(canvas.width() as usize) {
                if mask[(y, x)] <= MASK_COVERED {
                    continue;
                }
                let px = canvas.get_pixel_mut(x as u32, y as u32);
                px[0] = blend(px[0], 255, a);
                px[1] = blend(px[1], 0, a);
                px[2] = blend(px[2], 0, a);
            }
        }
    }

    /// Draw one detection box. `alpha` fades held-over boxes; fresh boxes
    /// come through at full strength.
    pub fn draw_box(&self, canvas: &mut RgbImage, bbox: &BoundingBox, confidence: f32, alpha: f32) {
        let intensity = (200.0 + confidence * 55.0).min(255.0);
        let channel = (intensity * alpha.clamp(0.0, 1.0)) as u8;
        let color = Rgb([channel, 0, 0]);

        let x = bbox.x1 as i32;
        let y = bbox.y1 as i32;
        let w = bbox.width() as u32;
        let h = bbox.height() as u32;
        for inset in 0..BOX_THICKNESS {
            let w = w.saturating_sub(2 * inset as u32);
            let h = h.saturating_sub(2 * inset as u32);
            if w == 0 || h == 0 {
                break;
            }
            draw_hollow_rect_mut(canvas, Rect::at(x + inset, y + inset).of_size(w, h), color);
        }

        if let Some(font) = &self.font {
            let label = format!("fire {:.2}", confidence);
            let ty = (y - LABEL_SCALE as i32 - 2).max(0);
            draw_text_mut(
                canvas,
                color,
                x,
                ty,
                PxScale::from(LABEL_SCALE),
                font,
                &label,
            );
        }
    }

    /// Translucent badge in the top-left corner showing the delivery rate.
    pub fn draw_fps_badge(&self, canvas: &mut RgbImage, fps: f64) {
        let (bw, bh) = (130u32.min(canvas.width()), 30u32.min(canvas.height()));
        let a = self.fps_badge_alpha;
        for y in 0..bh {
            for x in 0..bw {
                let px = canvas.get_pixel_mut(x, y);
                px[0] = blend(px[0], 0, a);
                px[1] = blend(px[1], 0, a);
                px[2] = blend(px[2], 0, a);
            }
        }
        if let Some(font) = &self.font {
            let text = format!("FPS: {fps:.1}");
            draw_text_mut(
                canvas,
                Rgb([255, 255, 255]),
                6,
                5,
                PxScale::from(LABEL_SCALE),
                font,
                &text,
            );
        }
    }
}

fn blend(under: u8, over: u8, alpha: f32) -> u8 {
    (under as f32 * (1.0 - alpha) + over as f32 * alpha) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_overlay() -> Overlay {
        Overlay {
            font: None,
            mask_alpha: 0.6,
            fps_badge_alpha: 0.25,
        }
    }

    #[test]
    fn mask_tints_only_covered_pixels() {
        let overlay = bare_overlay();
        let mut canvas = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        let mut mask = Array2::<f32>::zeros((4, 4));
        mask[(1, 1)] = 0.9;

        overlay.blend_mask(&mut canvas, &mask);

        let tinted = canvas.get_pixel(1, 1);
        assert!(tinted[0] > 100 && tinted[1] < 100);
        assert_eq!(*canvas.get_pixel(0, 0), Rgb([100, 100, 100]));
    }

    #[test]
    fn held_box_is_dimmer_than_fresh() {
        let overlay = bare_overlay();
        let bbox = BoundingBox::new(2.0, 2.0, 12.0, 12.0);

        let mut fresh = RgbImage::new(16, 16);
        overlay.draw_box(&mut fresh, &bbox, 0.8, 1.0);
        let mut held = RgbImage::new(16, 16);
        overlay.draw_box(&mut held, &bbox, 0.8, 0.6);

        assert!(fresh.get_pixel(2, 2)[0] > held.get_pixel(2, 2)[0]);
    }

    #[test]
    fn degenerate_box_does_not_panic() {
        let overlay = bare_overlay();
        let mut canvas = RgbImage::new(8, 8);
        overlay.draw_box(&mut canvas, &BoundingBox::new(3.0, 3.0, 3.0, 3.0), 0.5, 1.0);
    }
}
