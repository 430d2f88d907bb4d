//! Facial landmark annotations: parsing and heatmap rasterisation.

use crate::error::DataError;
use std::fs;
use std::path::Path;

/// Landmark points in pixel coordinates, `(x, y)`
pub type Landmarks = Vec<(f32, f32)>;

/// Load a landmark file. Accepts 300-W `.pts` files and plain `x y` lines.
pub fn load_landmarks(path: &Path) -> Result<Landmarks, DataError> {
    let text = fs::read_to_string(path).map_err(|e| DataError::io(path, e))?;
    parse_landmarks(&text).map_err(|reason| DataError::Landmarks {
        path: path.to_path_buf(),
        reason,
    })
}

pub fn parse_landmarks(text: &str) -> Result<Landmarks, String> {
    let mut points = Vec::new();
    let mut declared: Option<usize> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line == "{" || line == "}" || line.starts_with("version") {
            continue;
        }
        if let Some(rest) = line.strip_prefix("n_points:") {
            let n = rest
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("bad n_points header '{}'", line))?;
            declared = Some(n);
            continue;
        }

        let mut coords = line.split(|c: char| c.is_whitespace() || c == ',').filter(|s| !s.is_empty());
        let (x, y) = match (coords.next(), coords.next(), coords.next()) {
            (Some(x), Some(y), None) => (x, y),
            _ => return Err(format!("expected 'x y', found '{}'", line)),
        };
        let x = x.parse::<f32>().map_err(|_| format!("bad coordinate '{}'", x))?;
        let y = y.parse::<f32>().map_err(|_| format!("bad coordinate '{}'", y))?;
        points.push((x, y));
    }

    if points.is_empty() {
        return Err("no points".to_string());
    }
    if let Some(n) = declared {
        if n != points.len() {
            return Err(format!("header declares {} points, found {}", n, points.len()));
        }
    }
    Ok(points)
}

/// Rasterise landmarks into a `size x size` single-channel heatmap (row-major).
///
/// Every point contributes a Gaussian blob; overlapping blobs keep the maximum,
/// so the map stays in [0, 1]. Points outside the frame are dropped.
pub fn render_heatmap(points: &[(f32, f32)], size: usize, sigma: f32) -> Vec<f32> {
    let mut map = vec![0f32; size * size];
    let radius = (3.0 * sigma).ceil() as i64;
    let denom = 2.0 * sigma * sigma;

    for &(px, py) in points {
        if !(px >= 0.0 && py >= 0.0 && px < size as f32 && py < size as f32) {
            continue;
        }
        let cx = px.round() as i64;
        let cy = py.round() as i64;
        for y in (cy - radius).max(0)..=(cy + radius).min(size as i64 - 1) {
            for x in (cx - radius).max(0)..=(cx + radius).min(size as i64 - 1) {
                let dx = x as f32 - px;
                let dy = y as f32 - py;
                let v = (-(dx * dx + dy * dy) / denom).exp();
                let cell = &mut map[y as usize * size + x as usize];
                if v > *cell {
                    *cell = v;
                }
            }
        }
    }
    map
}

/// Blob width for a given output resolution (1.5 px at 256)
pub fn heatmap_sigma(img_size: usize) -> f32 {
    (1.5 * img_size as f32 / 256.0).max(0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pts() {
        let text = "version: 1\nn_points:  3\n{\n10.5 20.0\n30 40\n50.25 60.75\n}\n";
        let points = parse_landmarks(text).unwrap();
        assert_eq!(points, vec![(10.5, 20.0), (30.0, 40.0), (50.25, 60.75)]);
    }

    #[test]
    fn test_parse_plain_and_errors() {
        assert_eq!(parse_landmarks("1 2\n3,4\n").unwrap(), vec![(1.0, 2.0), (3.0, 4.0)]);
        assert!(parse_landmarks("").is_err());
        assert!(parse_landmarks("1 2 3\n").is_err());
        assert!(parse_landmarks("n_points: 2\n{\n1 2\n}\n").is_err());
        assert!(parse_landmarks("a b\n").is_err());
    }

    #[test]
    fn test_heatmap_peak_and_bounds() {
        let size = 16;
        let map = render_heatmap(&[(4.0, 5.0), (100.0, 3.0)], size, 1.0);
        assert_eq!(map.len(), size * size);
        assert!((map[5 * size + 4] - 1.0).abs() < 1e-6);
        assert!(map[5 * size + 6] < map[5 * size + 5]);
        assert!(map.iter().all(|&v| (0.0..=1.0).contains(&v)));
        // far corner untouched
        assert_eq!(map[size * size - 1], 0.0);
    }
}
