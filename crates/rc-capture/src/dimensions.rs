//! Capture rectangle sizing: fit the screen into a capped box while
//! preserving its aspect ratio, with both dimensions even (required by
//! most hardware encoders' chroma subsampling).

/// Default cap, used when no operator override is configured.
pub const MAX_WIDTH: u32 = 1280;
pub const MAX_HEIGHT: u32 = 800;

/// Compute `(capture_w, capture_h)` for a given screen size: the
/// largest rectangle that preserves `screen_w / screen_h`, fits inside
/// `(max_w, max_h)`, and has both dimensions even.
#[must_use]
pub fn compute_capture_dimensions(screen_w: u32, screen_h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if screen_w == 0 || screen_h == 0 {
        return (0, 0);
    }

    let scale = (f64::from(max_w) / f64::from(screen_w)).min(f64::from(max_h) / f64::from(screen_h));
    let scale = scale.min(1.0); // never upscale past the screen's own resolution

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut w = ((f64::from(screen_w) * scale).round() as u32).max(2);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut h = ((f64::from(screen_h) * scale).round() as u32).max(2);

    if w % 2 != 0 {
        w -= 1;
    }
    if h % 2 != 0 {
        h -= 1;
    }

    (w.min(max_w), h.min(max_h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_a_larger_than_max_1080p_screen() {
        let (w, h) = compute_capture_dimensions(1920, 1080, MAX_WIDTH, MAX_HEIGHT);
        assert!(w <= MAX_WIDTH && h <= MAX_HEIGHT);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
        // aspect preserved within rounding
        let original_aspect = 1920.0 / 1080.0;
        let scaled_aspect = f64::from(w) / f64::from(h);
        assert!((original_aspect - scaled_aspect).abs() < 0.01);
    }

    #[test]
    fn leaves_a_smaller_screen_unscaled() {
        let (w, h) = compute_capture_dimensions(640, 480, MAX_WIDTH, MAX_HEIGHT);
        assert_eq!((w, h), (640, 480));
    }

    #[test]
    fn always_produces_even_dimensions() {
        let (w, h) = compute_capture_dimensions(1921, 1081, MAX_WIDTH, MAX_HEIGHT);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
    }

    #[test]
    fn ultrawide_screen_is_width_bound() {
        let (w, h) = compute_capture_dimensions(3440, 1440, MAX_WIDTH, MAX_HEIGHT);
        assert_eq!(w, MAX_WIDTH);
        assert!(h <= MAX_HEIGHT);
    }

    #[test]
    fn tall_portrait_screen_is_height_bound() {
        let (w, h) = compute_capture_dimensions(1080, 1920, MAX_WIDTH, MAX_HEIGHT);
        assert_eq!(h, MAX_HEIGHT);
        assert!(w <= MAX_WIDTH);
    }

    #[test]
    fn zero_dimension_is_handled_without_panic() {
        assert_eq!(compute_capture_dimensions(0, 1080, MAX_WIDTH, MAX_HEIGHT), (0, 0));
    }

    #[test]
    fn operator_override_caps_below_the_default() {
        let (w, h) = compute_capture_dimensions(1920, 1080, 640, 480);
        assert!(w <= 640 && h <= 480);
    }
}
