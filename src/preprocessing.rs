// src/preprocessing.rs
//
// Pixel-level frame preparation: resizing, cropping and model input
// packing. Operates on packed RGB buffers.

use crate::types::{Frame, PixelRect};

/// Resize to `target_width`, preserving aspect ratio. Frames already at
/// or below the target are returned unchanged.
pub fn resize_to_width(frame: &Frame, target_width: usize) -> Frame {
    if target_width == 0 || frame.width <= target_width {
        return frame.clone();
    }
    let scale = target_width as f32 / frame.width as f32;
    let target_height = ((frame.height as f32 * scale).round() as usize).max(1);
    let data = resize_rgb(&frame.data, frame.width, frame.height, target_width, target_height);
    Frame::new(data, target_width, target_height, frame.index, frame.timestamp)
}

/// Resize packed RGB. Area averaging when shrinking, bilinear otherwise.
pub fn resize_rgb(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    if dst_w <= src_w && dst_h <= src_h {
        resize_area(src, src_w, src_h, dst_w, dst_h)
    } else {
        resize_bilinear(src, src_w, src_h, dst_w, dst_h)
    }
}

/// Bilinear image resize
pub fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];

    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;

            let sx0 = (sx.floor() as usize).min(src_w - 1);
            let sy0 = (sy.floor() as usize).min(src_h - 1);
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);

            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}

/// Box-filter downscale: each output pixel averages the source pixels its
/// footprint covers, weighted by coverage.
pub fn resize_area(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        let y0 = dy as f32 * y_ratio;
        let y1 = y0 + y_ratio;
        for dx in 0..dst_w {
            let x0 = dx as f32 * x_ratio;
            let x1 = x0 + x_ratio;

            let mut acc = [0.0f32; 3];
            let mut weight = 0.0f32;
            let mut sy = y0.floor() as usize;
            while (sy as f32) < y1 && sy < src_h {
                let wy = (y1.min(sy as f32 + 1.0) - y0.max(sy as f32)).max(0.0);
                let mut sx = x0.floor() as usize;
                while (sx as f32) < x1 && sx < src_w {
                    let wx = (x1.min(sx as f32 + 1.0) - x0.max(sx as f32)).max(0.0);
                    let w = wx * wy;
                    let i = (sy * src_w + sx) * 3;
                    for c in 0..3 {
                        acc[c] += src[i + c] as f32 * w;
                    }
                    weight += w;
                    sx += 1;
                }
                sy += 1;
            }

            if weight > 0.0 {
                let o = (dy * dst_w + dx) * 3;
                for c in 0..3 {
                    dst[o + c] = (acc[c] / weight).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }
    dst
}

/// Crop a packed RGB frame to a pixel rectangle.
pub fn crop_rgb(frame: &Frame, rect: &PixelRect) -> Frame {
    let mut data = Vec::with_capacity(rect.area() * 3);
    for y in rect.y..rect.y + rect.height {
        let start = (y * frame.width + rect.x) * 3;
        data.extend_from_slice(&frame.data[start..start + rect.width * 3]);
    }
    Frame::new(data, rect.width, rect.height, frame.index, frame.timestamp)
}

/// Letterboxed, normalized CHW tensor for a square detector input.
pub struct Letterbox {
    pub input: Vec<f32>,
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Map a box from model input space back to source pixels.
    pub fn unmap(&self, bbox: [f32; 4]) -> [f32; 4] {
        [
            (bbox[0] - self.pad_x) / self.scale,
            (bbox[1] - self.pad_y) / self.scale,
            (bbox[2] - self.pad_x) / self.scale,
            (bbox[3] - self.pad_y) / self.scale,
        ]
    }
}

pub fn letterbox(src: &[u8], src_w: usize, src_h: usize, target_size: usize) -> Letterbox {
    // Fit inside target x target keeping aspect ratio
    let scale = (target_size as f32 / src_w as f32).min(target_size as f32 / src_h as f32);
    let scaled_w = ((src_w as f32 * scale) as usize).clamp(1, target_size);
    let scaled_h = ((src_h as f32 * scale) as usize).clamp(1, target_size);

    let pad_x = (target_size - scaled_w) as f32 / 2.0;
    let pad_y = (target_size - scaled_h) as f32 / 2.0;

    let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

    // Gray padding
    let mut canvas = vec![114u8; target_size * target_size * 3];
    for y in 0..scaled_h {
        for x in 0..scaled_w {
            let src_idx = (y * scaled_w + x) * 3;
            let dst_idx = ((y + pad_y as usize) * target_size + x + pad_x as usize) * 3;
            canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
        }
    }

    // [0, 255] -> [0, 1], HWC -> CHW
    let plane = target_size * target_size;
    let mut input = vec![0.0f32; 3 * plane];
    for (i, px) in canvas.chunks_exact(3).enumerate() {
        for c in 0..3 {
            input[c * plane + i] = px[c] as f32 / 255.0;
        }
    }

    Letterbox {
        input,
        scale,
        pad_x,
        pad_y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_to_width_keeps_aspect() {
        let frame = Frame::new(vec![100u8; 1280 * 720 * 3], 1280, 720, 0, 0.0);
        let small = resize_to_width(&frame, 320);
        assert_eq!(small.width, 320);
        assert_eq!(small.height, 180);
        assert!(small.data.iter().all(|&p| p == 100));
    }

    #[test]
    fn test_resize_to_width_never_upscales() {
        let frame = Frame::new(vec![0u8; 100 * 50 * 3], 100, 50, 3, 0.1);
        let out = resize_to_width(&frame, 320);
        assert_eq!(out.width, 100);
        assert_eq!(out.index, 3);
    }

    #[test]
    fn test_area_resize_averages() {
        // 2x1 black/white -> 1x1 mid gray
        let src = vec![0, 0, 0, 255, 255, 255];
        let dst = resize_area(&src, 2, 1, 1, 1);
        assert_eq!(dst, vec![128, 128, 128]);
    }

    #[test]
    fn test_crop_rgb() {
        let mut data = vec![0u8; 4 * 4 * 3];
        data[(2 * 4 + 3) * 3] = 255;
        let frame = Frame::new(data, 4, 4, 0, 0.0);
        let crop = crop_rgb(
            &frame,
            &PixelRect {
                x: 2,
                y: 2,
                width: 2,
                height: 2,
            },
        );
        assert_eq!(crop.width, 2);
        assert_eq!(crop.rgb(1, 0), [255, 0, 0]);
    }

    #[test]
    fn test_letterbox_roundtrip_box() {
        let src = vec![50u8; 1280 * 720 * 3];
        let lb = letterbox(&src, 1280, 720, 640);
        assert_eq!(lb.input.len(), 3 * 640 * 640);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert!((lb.pad_y - 140.0).abs() < 1e-6);
        let b = lb.unmap([0.0, 140.0, 640.0, 500.0]);
        assert!((b[1]).abs() < 1e-3);
        assert!((b[3] - 720.0).abs() < 1e-3);
    }
}
