//! Face crops for the embedding and attribute models.
//!
//! Landmarked faces are warped onto the five InsightFace reference points
//! with a least-squares similarity transform (scale, rotation, translation).
//! The same warp produces margin crops for the attribute models.

use crate::types::BoundingBox;
use image::{imageops, Rgb, RgbImage};

/// Side of the ArcFace input crop.
pub const ALIGNED_SIZE: u32 = 112;

/// Eye, eye, nose, mouth corner, mouth corner positions in a 112x112 crop.
const ARCFACE_TEMPLATE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// `x' = a*x - b*y + tx`, `y' = b*x + a*y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit mapping `src` points onto `dst` points.
    fn fit(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        let n = src.len().min(dst.len());
        if n == 0 {
            return None;
        }
        let centroid = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n].iter().fold((0.0f32, 0.0f32), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n as f32, sy / n as f32)
        };
        let (smx, smy) = centroid(src);
        let (dmx, dmy) = centroid(dst);

        let (mut dot, mut cross, mut energy) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst).take(n) {
            let (sx, sy, dx, dy) = (sx - smx, sy - smy, dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            energy += sx * sx + sy * sy;
        }
        if energy <= f32::EPSILON {
            return None;
        }

        let (a, b) = (dot / energy, cross / energy);
        Some(Self { a, b, tx: dmx - (a * smx - b * smy), ty: dmy - (b * smx + a * smy) })
    }

    fn scale_about(scale: f32, center: (f32, f32), target: (f32, f32)) -> Self {
        Self { a: scale, b: 0.0, tx: target.0 - scale * center.0, ty: target.1 - scale * center.1 }
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det <= f32::EPSILON {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self { a, b, tx: -(a * self.tx - b * self.ty), ty: -(b * self.tx + a * self.ty) })
    }
}

/// Render an `out_size` square where each output pixel samples the source
/// through the inverse of `transform`. Outside the source is black.
fn warp(image: &RgbImage, transform: &Similarity, out_size: u32) -> RgbImage {
    let mut output = RgbImage::new(out_size, out_size);
    let Some(back) = transform.inverse() else {
        return output;
    };

    let (w, h) = (image.width() as i64, image.height() as i64);
    let texel = |x: i64, y: i64| -> [f32; 3] {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            image.get_pixel(x as u32, y as u32).0.map(f32::from)
        } else {
            [0.0; 3]
        }
    };

    for (ox, oy, out) in output.enumerate_pixels_mut() {
        let (sx, sy) = back.apply((ox as f32, oy as f32));
        let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);

        let corners = [
            (texel(x0, y0), (1.0 - fx) * (1.0 - fy)),
            (texel(x0 + 1, y0), fx * (1.0 - fy)),
            (texel(x0, y0 + 1), (1.0 - fx) * fy),
            (texel(x0 + 1, y0 + 1), fx * fy),
        ];
        let mut rgb = [0u8; 3];
        for (c, channel) in rgb.iter_mut().enumerate() {
            let value: f32 = corners.iter().map(|(px, weight)| px[c] * weight).sum();
            *channel = value.round().clamp(0.0, 255.0) as u8;
        }
        *out = Rgb(rgb);
    }

    output
}

/// Warp a face onto the ArcFace template, giving a 112x112 crop.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    match Similarity::fit(landmarks, &ARCFACE_TEMPLATE) {
        Some(transform) => warp(image, &transform, ALIGNED_SIZE),
        None => RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE),
    }
}

/// Square crop centred on the face, `margin` times its longest side, scaled to `out_size`.
pub fn crop_centered(image: &RgbImage, face: &BoundingBox, margin: f32, out_size: u32) -> RgbImage {
    let side = face.width.max(face.height) * margin;
    if side <= 0.0 {
        return RgbImage::new(out_size, out_size);
    }
    let center = (face.x + face.width / 2.0, face.y + face.height / 2.0);
    let half = out_size as f32 / 2.0;
    warp(image, &Similarity::scale_about(out_size as f32 / side, center, (half, half)), out_size)
}

/// The face box cut out of the image and stretched to `width` x `height`.
pub fn crop_resized(image: &RgbImage, face: &BoundingBox, width: u32, height: u32) -> RgbImage {
    let left = face.x.max(0.0).floor() as u32;
    let top = face.y.max(0.0).floor() as u32;
    let right = ((face.x + face.width).ceil().max(0.0) as u32).min(image.width());
    let bottom = ((face.y + face.height).ceil().max(0.0) as u32).min(image.height());

    if right <= left || bottom <= top {
        return RgbImage::new(width, height);
    }

    let region = imageops::crop_imm(image, left, top, right - left, bottom - top).to_image();
    imageops::resize(&region, width, height, imageops::FilterType::Triangle)
}
