// Detection overlay drawn onto packed RGB frames

use crate::devices::{BoundingBox, Detection};

pub const BOX_COLOR: [u8; 3] = [0, 255, 0];
pub const BOX_THICKNESS: u32 = 2;

/// Vertical gap between a box's top edge and its label baseline
const LABEL_OFFSET: u32 = 5;

/// Label glyphs are drawn at this integer scale
const FONT_SCALE: u32 = 2;
const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

/// Pixel rectangle fully inside its frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

/// Rescale a box from detector coordinates (`from`) to frame coordinates
/// (`to`) and clip it to `[0, width) x [0, height)`.
///
/// Returns `None` when nothing of the box remains inside the frame.
pub fn scale_and_clip(bbox: &BoundingBox, from: (u32, u32), to: (u32, u32)) -> Option<Rect> {
    let (from_w, from_h) = from;
    let (to_w, to_h) = to;
    if from_w == 0 || from_h == 0 || to_w == 0 || to_h == 0 {
        return None;
    }

    let sx = to_w as f32 / from_w as f32;
    let sy = to_h as f32 / from_h as f32;
    let (left, right) = ordered(bbox.left * sx, bbox.right * sx);
    let (top, bottom) = ordered(bbox.top * sy, bbox.bottom * sy);

    let (x0, x1) = clip_span(left, right, to_w)?;
    let (y0, y1) = clip_span(top, bottom, to_h)?;
    Some(Rect {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

fn ordered(a: f32, b: f32) -> (f32, f32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Intersect `[lo, hi)` with `[0, limit)` in whole pixels
fn clip_span(lo: f32, hi: f32, limit: u32) -> Option<(u32, u32)> {
    if !lo.is_finite() || !hi.is_finite() {
        return None;
    }
    let start = lo.max(0.0).floor();
    let end = hi.min(limit as f32).ceil();
    if end <= start {
        return None;
    }
    let start = start as u32;
    let end = (end as u32).min(limit);
    (end > start).then_some((start, end))
}

/// `"<label> <confidence>"` with the confidence to two significant digits
pub fn format_label(label: &str, confidence: f32) -> String {
    format!("{} {}", label, format_confidence(confidence))
}

fn format_confidence(confidence: f32) -> String {
    if !confidence.is_finite() || confidence <= 0.0 {
        return format!("{:.2}", confidence.max(0.0));
    }
    let value = confidence as f64;
    let mut magnitude = value.log10().floor() as i32;
    let scale = 10f64.powi(1 - magnitude);
    let rounded = (value * scale).round() / scale;
    // Rounding can carry into the next power of ten (0.996 -> 1.0)
    if rounded >= 10f64.powi(magnitude + 1) {
        magnitude += 1;
    }
    let decimals = (1 - magnitude).max(0) as usize;
    format!("{:.*}", decimals, rounded)
}

/// Draw every detection as a box plus label onto a `width` x `height` RGB frame.
///
/// Boxes arrive in detector coordinates of size `detector_size`.
pub fn draw_detections(
    rgb: &mut [u8],
    width: u32,
    height: u32,
    detector_size: (u32, u32),
    detections: &[Detection],
) -> usize {
    if rgb.len() < width as usize * height as usize * 3 {
        return 0;
    }

    let mut drawn = 0;
    for detection in detections {
        let Some(rect) = scale_and_clip(&detection.bbox, detector_size, (width, height)) else {
            continue;
        };
        draw_rect(rgb, width, &rect, BOX_COLOR, BOX_THICKNESS);

        let text = format_label(&detection.label, detection.confidence);
        let text_height = GLYPH_HEIGHT * FONT_SCALE;
        let text_top = rect.y as i64 - LABEL_OFFSET as i64 - text_height as i64;
        draw_text(rgb, width, height, rect.x as i64, text_top.max(0), &text, BOX_COLOR);
        drawn += 1;
    }
    drawn
}

/// Outline `rect` with a border `thickness` pixels wide, drawn inward
pub fn draw_rect(rgb: &mut [u8], width: u32, rect: &Rect, color: [u8; 3], thickness: u32) {
    let t = thickness.max(1);
    for y in rect.y..rect.bottom() {
        let edge_row = y < rect.y + t || y + t >= rect.bottom();
        if edge_row {
            for x in rect.x..rect.right() {
                put_pixel(rgb, width, x, y, color);
            }
            continue;
        }
        let left_end = (rect.x + t).min(rect.right());
        let right_start = rect.right().saturating_sub(t).max(left_end);
        for x in (rect.x..left_end).chain(right_start..rect.right()) {
            put_pixel(rgb, width, x, y, color);
        }
    }
}

fn put_pixel(rgb: &mut [u8], width: u32, x: u32, y: u32, color: [u8; 3]) {
    let i = (y as usize * width as usize + x as usize) * 3;
    if let Some(px) = rgb.get_mut(i..i + 3) {
        px.copy_from_slice(&color);
    }
}

/// Render `text` with its top-left corner at (x, y); pixels outside the frame are skipped
pub fn draw_text(rgb: &mut [u8], width: u32, height: u32, x: i64, y: i64, text: &str, color: [u8; 3]) {
    let advance = ((GLYPH_WIDTH + 1) * FONT_SCALE) as i64;
    for (n, ch) in text.chars().enumerate() {
        let Some(rows) = glyph(ch) else {
            continue;
        };
        let origin_x = x + n as i64 * advance;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                for dy in 0..FONT_SCALE {
                    for dx in 0..FONT_SCALE {
                        let px = origin_x + (col * FONT_SCALE + dx) as i64;
                        let py = y + (row as u32 * FONT_SCALE + dy) as i64;
                        if px >= 0 && py >= 0 && px < width as i64 && py < height as i64 {
                            put_pixel(rgb, width, px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
    }
}

/// 5x7 bitmap rows, MSB on the left. Lowercase shares the uppercase shapes.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
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
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(left: f32, top: f32, right: f32, bottom: f32) -> BoundingBox {
        BoundingBox { left, top, right, bottom }
    }

    #[test]
    fn boxes_are_rescaled_to_display_resolution() {
        let rect = scale_and_clip(&bbox(64.0, 64.0, 320.0, 320.0), (640, 640), (1280, 720)).unwrap();
        assert_eq!(rect, Rect { x: 128, y: 72, width: 512, height: 288 });
    }

    #[test]
    fn oversized_boxes_stay_inside_the_frame() {
        let cases = [
            bbox(-50.0, -20.0, 700.0, 900.0),
            bbox(600.0, 600.0, 2000.0, 2000.0),
            bbox(639.9, 0.0, 640.0, 1.0),
            bbox(320.0, 320.0, 100.0, 100.0),
        ];
        for case in cases {
            let rect = scale_and_clip(&case, (640, 640), (1280, 720)).unwrap();
            assert!(rect.width > 0 && rect.height > 0);
            assert!(rect.right() <= 1280, "{:?}", rect);
            assert!(rect.bottom() <= 720, "{:?}", rect);
        }
    }

    #[test]
    fn boxes_outside_the_frame_are_dropped() {
        assert!(scale_and_clip(&bbox(-100.0, 0.0, -10.0, 50.0), (640, 640), (1280, 720)).is_none());
        assert!(scale_and_clip(&bbox(700.0, 0.0, 800.0, 50.0), (640, 640), (1280, 720)).is_none());
        assert!(scale_and_clip(&bbox(f32::NAN, 0.0, 10.0, 50.0), (640, 640), (1280, 720)).is_none());
    }

    #[test]
    fn labels_use_two_significant_digits() {
        assert_eq!(format_label("person", 0.87), "person 0.87");
        assert_eq!(format_label("car", 0.054), "car 0.054");
        assert_eq!(format_label("dog", 0.5), "dog 0.50");
        assert_eq!(format_label("cat", 1.0), "cat 1.0");
    }

    #[test]
    fn rounding_carry_keeps_two_significant_digits() {
        assert_eq!(format_label("person", 0.996), "person 1.0");
        assert_eq!(format_label("person", 0.0996), "person 0.10");
        assert_eq!(format_label("person", 0.994), "person 0.99");
    }

    #[test]
    fn drawing_never_touches_pixels_outside_the_box() {
        let (w, h) = (32u32, 24u32);
        let mut rgb = vec![0u8; (w * h * 3) as usize];
        let rect = Rect { x: 4, y: 6, width: 10, height: 8 };
        draw_rect(&mut rgb, w, &rect, BOX_COLOR, BOX_THICKNESS);

        for y in 0..h {
            for x in 0..w {
                let i = ((y * w + x) * 3) as usize;
                let lit = rgb[i + 1] == 255;
                let inside = x >= rect.x && x < rect.right() && y >= rect.y && y < rect.bottom();
                let border = inside
                    && (x < rect.x + 2 || x >= rect.right() - 2 || y < rect.y + 2 || y >= rect.bottom() - 2);
                assert_eq!(lit, border, "pixel ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn detections_near_edges_draw_without_panicking() {
        let (w, h) = (64u32, 48u32);
        let mut rgb = vec![0u8; (w * h * 3) as usize];
        let detections = vec![
            Detection {
                class_id: 0,
                label: "person".into(),
                confidence: 0.91,
                bbox: bbox(-10.0, -10.0, 700.0, 700.0),
            },
            Detection {
                class_id: 2,
                label: "car".into(),
                confidence: 0.4,
                bbox: bbox(620.0, 620.0, 639.0, 639.0),
            },
        ];
        assert_eq!(draw_detections(&mut rgb, w, h, (640, 640), &detections), 2);
        // Top-left corner belongs to the first box border
        assert_eq!(&rgb[..3], &BOX_COLOR);
    }
}
