//! Frame type and pixel conversion: YUYV/GREY to RGB, darkness check, box drawing.

use image::RgbImage;

/// A captured color camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Interleaved RGB8 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.len() < 3 {
            return 0.0;
        }
        let pixels = self.data.len() / 3;
        self.data.chunks_exact(3).map(luma).sum::<f32>() / pixels as f32
    }

    /// Whether more than `threshold_pct` of the pixels are near black.
    pub fn is_dark(&self, threshold_pct: f32) -> bool {
        if self.data.len() < 3 {
            return true;
        }
        let pixels = self.data.len() / 3;
        let dark = self.data.chunks_exact(3).filter(|p| luma(p) < 32.0).count();
        (dark as f32 / pixels as f32) > threshold_pct
    }

    /// Draw an unfilled rectangle, clipped to the frame.
    pub fn draw_box(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, color: [u8; 3], thickness: i32) {
        let (w, h) = (self.width as i32, self.height as i32);
        for t in 0..thickness.max(1) {
            let (l, r, top, bot) = (x1 + t, x2 - t, y1 + t, y2 - t);
            if l > r || top > bot {
                break;
            }
            for x in l..=r {
                self.put(x, top, color, w, h);
                self.put(x, bot, color, w, h);
            }
            for y in top..=bot {
                self.put(l, y, color, w, h);
                self.put(r, y, color, w, h);
            }
        }
    }

    /// Draw `text` with its top-left corner at (x, y) in a 5x7 bitmap font,
    /// each font pixel `scale` pixels wide. Characters without a glyph
    /// leave a gap. Clipped to the frame.
    pub fn draw_text(&mut self, x: i32, y: i32, text: &str, color: [u8; 3], scale: i32) {
        let (w, h) = (self.width as i32, self.height as i32);
        let scale = scale.max(1);
        for (i, ch) in text.chars().enumerate() {
            let Some(rows) = glyph(ch) else { continue };
            let left = x + i as i32 * GLYPH_ADVANCE * scale;
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..5 {
                    if bits & (0x10 >> col) == 0 {
                        continue;
                    }
                    let (px, py) = (left + col * scale, y + row as i32 * scale);
                    for dy in 0..scale {
                        for dx in 0..scale {
                            self.put(px + dx, py + dy, color, w, h);
                        }
                    }
                }
            }
        }
    }

    fn put(&mut self, x: i32, y: i32, color: [u8; 3], w: i32, h: i32) {
        if x < 0 || y < 0 || x >= w || y >= h {
            return;
        }
        let i = (y as usize * w as usize + x as usize) * 3;
        if let Some(px) = self.data.get_mut(i..i + 3) {
            px.copy_from_slice(&color);
        }
    }

    /// Copy into an `image` buffer, e.g. for saving a preview.
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }
}

/// Horizontal distance between glyph origins, in font pixels.
const GLYPH_ADVANCE: i32 = 6;

/// Rows of a 5x7 glyph, most significant of the low five bits leftmost.
/// Covers what annotation captions need: digits, `.:-` and the label letters.
fn glyph(ch: char) -> Option<[u8; 7]> {
    Some(match ch {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        'a' => [0x00, 0x00, 0x0E, 0x01, 0x0F, 0x11, 0x0F],
        'e' => [0x00, 0x00, 0x0E, 0x11, 0x1F, 0x10, 0x0E],
        'g' => [0x00, 0x0F, 0x11, 0x11, 0x0F, 0x01, 0x0E],
        'k' => [0x10, 0x10, 0x12, 0x14, 0x18, 0x14, 0x12],
        'n' => [0x00, 0x00, 0x16, 0x19, 0x11, 0x11, 0x11],
        'o' => [0x00, 0x00, 0x0E, 0x11, 0x11, 0x11, 0x0E],
        'r' => [0x00, 0x00, 0x16, 0x19, 0x10, 0x10, 0x10],
        't' => [0x08, 0x08, 0x1C, 0x08, 0x08, 0x09, 0x06],
        'u' => [0x00, 0x00, 0x11, 0x11, 0x11, 0x13, 0x0D],
        'w' => [0x00, 0x00, 0x11, 0x11, 0x15, 0x15, 0x0A],
        _ => return None,
    })
}

fn luma(p: &[u8]) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

/// Convert packed YUYV (4:2:2) to RGB with BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: yuyv.len() });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (quad[1] as i32 - 128, quad[3] as i32 - 128);
        for y in [quad[0], quad[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(clamp_u8((c + 409 * v + 128) >> 8));
            rgb.push(clamp_u8((c - 100 * u - 208 * v + 128) >> 8));
            rgb.push(clamp_u8((c + 516 * u + 128) >> 8));
        }
    }
    Ok(rgb)
}

/// Expand 8-bit grayscale to RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: gray.len() });
    }
    Ok(gray[..expected].iter().flat_map(|&g| [g, g, g]).collect())
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, color: [u8; 3]) -> Frame {
        let data = (0..width * height).flat_map(|_| color).collect();
        Frame::new(data, width, height, 0)
    }

    #[test]
    fn test_draw_text_glyph_pixels() {
        let mut frame = solid(20, 10, [0, 0, 0]);
        frame.draw_text(0, 0, "1", [9, 9, 9], 1);

        let at = |f: &Frame, x: usize, y: usize| f.data[(y * 20 + x) * 3];
        // '1': top row is a single pixel in column 2, bottom row spans columns 1..=3.
        assert_eq!(at(&frame, 2, 0), 9);
        assert_eq!(at(&frame, 1, 0), 0);
        assert_eq!((1..=3).map(|x| at(&frame, x, 6)).collect::<Vec<_>>(), vec![9, 9, 9]);
        assert_eq!(at(&frame, 0, 6), 0);
    }

    #[test]
    fn test_draw_text_clips_and_skips_unknown() {
        let mut frame = solid(8, 4, [0, 0, 0]);
        frame.draw_text(-3, -3, "8", [1, 2, 3], 2);
        frame.draw_text(0, 0, "?", [1, 2, 3], 1);
        assert_eq!(frame.data.len(), 8 * 4 * 3);

        let mut blank = solid(8, 8, [0, 0, 0]);
        blank.draw_text(0, 0, "? ", [1, 2, 3], 1);
        assert!(blank.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_yuyv_gray_levels() {
        // Neutral chroma: Y=16 is black, Y=235 is white.
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_red_dominant() {
        // BT.601 red: Y=81, U=90, V=240.
        let rgb = yuyv_to_rgb(&[81, 90, 81, 240], 2, 1).unwrap();
        assert!(rgb[0] > 240 && rgb[1] < 16 && rgb[2] < 16, "{rgb:?}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_rgb(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb() {
        assert_eq!(grey_to_rgb(&[7, 9], 2, 1).unwrap(), vec![7, 7, 7, 9, 9, 9]);
        assert!(grey_to_rgb(&[7], 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame() {
        assert!(solid(10, 10, [0, 0, 0]).is_dark(0.95));
        assert!(!solid(10, 10, [128, 128, 128]).is_dark(0.95));
        assert!(Frame::new(vec![], 0, 0, 0).is_dark(0.95));
    }

    #[test]
    fn test_avg_brightness() {
        assert!((solid(4, 4, [100, 100, 100]).avg_brightness() - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_draw_box_outline_only() {
        let mut f = solid(10, 10, [0, 0, 0]);
        f.draw_box(2, 2, 7, 7, [0, 200, 0], 1);
        let at = |f: &Frame, x: usize, y: usize| {
            let i = (y * 10 + x) * 3;
            [f.data[i], f.data[i + 1], f.data[i + 2]]
        };
        assert_eq!(at(&f, 2, 2), [0, 200, 0]);
        assert_eq!(at(&f, 7, 5), [0, 200, 0]);
        assert_eq!(at(&f, 4, 4), [0, 0, 0]);
    }

    #[test]
    fn test_draw_box_clips_to_frame() {
        let mut f = solid(4, 4, [0, 0, 0]);
        f.draw_box(-5, -5, 100, 100, [255, 0, 0], 2);
        assert_eq!(f.data.len(), 4 * 4 * 3);
    }

    #[test]
    fn test_to_image() {
        let img = solid(3, 2, [1, 2, 3]).to_image().unwrap();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(2, 1).0, [1, 2, 3]);
    }
}
