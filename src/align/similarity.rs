//! Least-squares similarity transforms and inverse-mapped bilinear warping.

use image::{Rgb, RgbImage};

/// `x' = a x - b y + tx`, `y' = b x + a y + ty`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Best fit (rotation, uniform scale, translation) taking `src` onto
    /// `dst`. `None` when the source points are degenerate.
    pub fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        if src.len() != dst.len() || src.len() < 2 {
            return None;
        }
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (mpx, mpy) = mean(src);
        let (mqx, mqy) = mean(dst);

        let (mut denom, mut dot, mut cross) = (0f32, 0f32, 0f32);
        for (&(px, py), &(qx, qy)) in src.iter().zip(dst) {
            let (px, py, qx, qy) = (px - mpx, py - mpy, qx - mqx, qy - mqy);
            denom += px * px + py * py;
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
        }
        if denom <= f32::EPSILON {
            return None;
        }

        let (a, b) = (dot / denom, cross / denom);
        Some(Self {
            a,
            b,
            tx: mqx - (a * mpx - b * mpy),
            ty: mqy - (b * mpx + a * mpy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    pub fn inverse(&self) -> Option<Self> {
        let r2 = self.a * self.a + self.b * self.b;
        if r2 <= f32::EPSILON {
            return None;
        }
        let (a, b) = (self.a / r2, -self.b / r2);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

fn bilinear(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return Rgb([0, 0, 0]);
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let mut out = [0u8; 3];
    for (c, slot) in out.iter_mut().enumerate() {
        let p = |xx: u32, yy: u32| img.get_pixel(xx, yy)[c] as f32;
        let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
        let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
        *slot = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Render a `size` x `size` image whose pixel `(u, v)` samples `img` at
/// `to_source(u, v)`; samples outside the source are black
pub fn warp(img: &RgbImage, to_source: &Similarity, size: u32) -> RgbImage {
    RgbImage::from_fn(size, size, |u, v| {
        let (x, y) = to_source.apply((u as f32, v as f32));
        bilinear(img, x, y)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-3 && (a.1 - b.1).abs() < 1e-3
    }

    #[test]
    fn test_recovers_known_transform() {
        let truth = Similarity {
            a: 1.5 * 0.3f32.cos(),
            b: 1.5 * 0.3f32.sin(),
            tx: 4.0,
            ty: -2.0,
        };
        let src = vec![(10.0, 12.0), (30.0, 11.0), (21.0, 25.0), (14.0, 33.0)];
        let dst: Vec<_> = src.iter().map(|&p| truth.apply(p)).collect();

        let fit = Similarity::estimate(&src, &dst).unwrap();
        for (&p, &q) in src.iter().zip(&dst) {
            assert!(close(fit.apply(p), q));
        }
        let back = fit.inverse().unwrap();
        assert!(close(back.apply(dst[2]), src[2]));
    }

    #[test]
    fn test_degenerate_points() {
        assert!(Similarity::estimate(&[(1.0, 1.0), (1.0, 1.0)], &[(0.0, 0.0), (2.0, 2.0)]).is_none());
        assert!(Similarity::estimate(&[(1.0, 1.0)], &[(0.0, 0.0)]).is_none());
    }

    #[test]
    fn test_warp_translation() {
        let mut img = RgbImage::new(8, 8);
        img.put_pixel(5, 3, Rgb([200, 10, 10]));
        // output (u, v) samples source (u + 2, v + 1)
        let shift = Similarity {
            a: 1.0,
            b: 0.0,
            tx: 2.0,
            ty: 1.0,
        };
        img.put_pixel(7, 7, Rgb([90, 90, 90]));
        let out = warp(&img, &shift, 7);
        assert_eq!(out.dimensions(), (7, 7));
        assert_eq!(out.get_pixel(3, 2), &Rgb([200, 10, 10]));
        assert_eq!(out.get_pixel(5, 6), &Rgb([90, 90, 90]));
        // (8, 7) is past the right edge of the source
        assert_eq!(out.get_pixel(6, 6), &Rgb([0, 0, 0]));
    }
}
