//! Scene rendering for the `screen` file.
//!
//! Two-phase design: capture (under the scene lock, fast) + render (no
//! lock, slow). The capture holds plain data only, so no scene types leak
//! into the rasterizer.

use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use image::{Rgba, RgbaImage};
use once_cell::sync::OnceCell;
use tracing::warn;

use crate::scene::item::ItemKind;
use crate::scene::manager::SceneManager;

/// Output image is scaled to fit within this width.
const MAX_RENDER_WIDTH: u32 = 1280;
const LABEL_SIZE: f32 = 16.0;

/// Font search paths, Linux first then macOS.
const FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationMono-Regular.ttf",
    "/System/Library/Fonts/Menlo.ttc",
    "/System/Library/Fonts/SFNSMono.ttf",
];

static FONT: OnceCell<Option<FontVec>> = OnceCell::new();

fn get_font() -> Option<&'static FontVec> {
    FONT.get_or_init(|| {
        for path in FONT_PATHS {
            if let Ok(bytes) = std::fs::read(path) {
                if let Ok(font) = FontVec::try_from_vec(bytes) {
                    return Some(font);
                }
            }
        }
        warn!("no monospace font found; screen labels will be omitted");
        None
    })
    .as_ref()
}

// ========== Captured data ==========

struct CapturedItem {
    kind: ItemKind,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    z: f64,
    opacity: f64,
    color: [u8; 3],
    text: Option<String>,
}

pub struct CapturedScene {
    width: u32,
    height: u32,
    background: [u8; 3],
    items: Vec<CapturedItem>,
}

/// Snapshot the visible items. Call under the scene lock.
pub fn capture(scene: &SceneManager) -> CapturedScene {
    let mut items: Vec<CapturedItem> = scene
        .items()
        .filter(|i| i.visible)
        .map(|i| CapturedItem {
            kind: i.kind,
            x: i.x,
            y: i.y,
            width: i.width,
            height: i.height,
            z: i.z,
            opacity: i.opacity.clamp(0.0, 1.0),
            color: parse_hex(&i.color),
            text: i.text.clone(),
        })
        .collect();
    items.sort_by(|a, b| a.z.partial_cmp(&b.z).unwrap_or(std::cmp::Ordering::Equal));

    CapturedScene {
        width: scene.width.max(1),
        height: scene.height.max(1),
        background: parse_hex(&scene.background),
        items,
    }
}

fn parse_hex(color: &str) -> [u8; 3] {
    let hex = color.trim_start_matches('#');
    if hex.len() == 6 {
        if let (Ok(r), Ok(g), Ok(b)) = (
            u8::from_str_radix(&hex[0..2], 16),
            u8::from_str_radix(&hex[2..4], 16),
            u8::from_str_radix(&hex[4..6], 16),
        ) {
            return [r, g, b];
        }
    }
    [128, 128, 128]
}

// ========== Rendering ==========

/// Rasterize a captured scene to PNG bytes. Runs without any lock held.
pub fn render_png(scene: &CapturedScene) -> Vec<u8> {
    let scale = (MAX_RENDER_WIDTH as f64 / scene.width as f64).min(1.0);
    let out_w = ((scene.width as f64 * scale) as u32).max(1);
    let out_h = ((scene.height as f64 * scale) as u32).max(1);

    let [br, bg, bb] = scene.background;
    let mut img = RgbaImage::from_pixel(out_w, out_h, Rgba([br, bg, bb, 255]));

    for item in &scene.items {
        let x = item.x * scale;
        let y = item.y * scale;
        let w = item.width * scale;
        let h = item.height * scale;
        match item.kind {
            ItemKind::Rect | ItemKind::Widget => {
                fill_rect(&mut img, x, y, w, h, item.color, item.opacity);
                if item.kind == ItemKind::Widget {
                    if let Some(text) = &item.text {
                        draw_text(&mut img, text, x + 4.0, y + 4.0, [255, 255, 255]);
                    }
                }
            }
            ItemKind::Ellipse => fill_ellipse(&mut img, x, y, w, h, item.color, item.opacity),
            ItemKind::Line => draw_line(&mut img, x, y, x + w, y + h, item.color, item.opacity),
            ItemKind::Text | ItemKind::Label => {
                if let Some(text) = &item.text {
                    draw_text(&mut img, text, x, y, item.color);
                }
            }
        }
    }

    let mut bytes = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut bytes);
    if let Err(e) = img.write_to(&mut cursor, image::ImageFormat::Png) {
        warn!(error = %e, "PNG encode failed");
    }
    bytes
}

fn blend(img: &mut RgbaImage, x: i64, y: i64, color: [u8; 3], alpha: f64) {
    if x < 0 || y < 0 || x >= img.width() as i64 || y >= img.height() as i64 {
        return;
    }
    let px = img.get_pixel_mut(x as u32, y as u32);
    for c in 0..3 {
        let base = px.0[c] as f64;
        px.0[c] = (base + (color[c] as f64 - base) * alpha) as u8;
    }
}

fn fill_rect(img: &mut RgbaImage, x: f64, y: f64, w: f64, h: f64, color: [u8; 3], opacity: f64) {
    for py in y as i64..(y + h) as i64 {
        for px in x as i64..(x + w) as i64 {
            blend(img, px, py, color, opacity);
        }
    }
}

fn fill_ellipse(img: &mut RgbaImage, x: f64, y: f64, w: f64, h: f64, color: [u8; 3], opacity: f64) {
    if w <= 0.0 || h <= 0.0 {
        return;
    }
    let (cx, cy) = (x + w / 2.0, y + h / 2.0);
    let (rx, ry) = (w / 2.0, h / 2.0);
    for py in y as i64..(y + h) as i64 {
        for px in x as i64..(x + w) as i64 {
            let dx = (px as f64 + 0.5 - cx) / rx;
            let dy = (py as f64 + 0.5 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                blend(img, px, py, color, opacity);
            }
        }
    }
}

fn draw_line(img: &mut RgbaImage, x1: f64, y1: f64, x2: f64, y2: f64, color: [u8; 3], opacity: f64) {
    let steps = ((x2 - x1).abs().max((y2 - y1).abs()) as usize).max(1);
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let x = x1 + (x2 - x1) * t;
        let y = y1 + (y2 - y1) * t;
        blend(img, x as i64, y as i64, color, opacity);
    }
}

fn draw_text(img: &mut RgbaImage, text: &str, x: f64, y: f64, color: [u8; 3]) {
    let Some(font) = get_font() else { return };
    let scale = PxScale::from(LABEL_SIZE);
    let scaled = font.as_scaled(scale);

    let mut pen_x = x as f32;
    let baseline = y as f32 + scaled.ascent();
    for ch in text.chars() {
        let glyph_id = scaled.glyph_id(ch);
        let glyph = glyph_id.with_scale_and_position(scale, ab_glyph::point(pen_x, baseline));
        let advance = scaled.h_advance(glyph_id);
        if let Some(outlined) = font.outline_glyph(glyph) {
            let bounds = outlined.px_bounds();
            outlined.draw(|gx, gy, cov| {
                let px = bounds.min.x as i64 + gx as i64;
                let py = bounds.min.y as i64 + gy as i64;
                blend(img, px, py, color, cov as f64);
            });
        }
        pen_x += advance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RioConfig;
    use crate::scene::item::SceneItem;

    #[test]
    fn renders_png_with_items() {
        let mut scene = SceneManager::new(&RioConfig {
            width: 640,
            height: 480,
            ..RioConfig::default()
        });
        let mut rect = SceneItem::new(ItemKind::Rect, 10.0, 10.0, 100.0, 50.0);
        rect.color = "#FF0000".to_string();
        scene.register_item(rect);
        scene.register_item(SceneItem::new(ItemKind::Ellipse, 200.0, 200.0, 60.0, 60.0));

        let cap = capture(&scene);
        let png = render_png(&cap);
        // PNG signature.
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn hex_parse_tolerates_garbage() {
        assert_eq!(parse_hex("#FF8000"), [255, 128, 0]);
        assert_eq!(parse_hex("bogus"), [128, 128, 128]);
    }

    #[test]
    fn invisible_items_are_skipped() {
        let mut scene = SceneManager::new(&RioConfig::default());
        let mut item = SceneItem::new(ItemKind::Rect, 0.0, 0.0, 10.0, 10.0);
        item.visible = false;
        scene.register_item(item);
        assert_eq!(capture(&scene).items.len(), 0);
    }
}
