//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

/// Calculate preview dimensions for a longer-edge target.
///
/// Scales the longer edge of `original` down to `target` while preserving
/// the aspect ratio. Never upscales: if the original already fits, its own
/// dimensions are returned. The shorter edge never rounds down to zero.
///
/// # Arguments
/// * `original` - Original image dimensions (width, height)
/// * `target` - Requested length of the longer edge
///
/// # Returns
/// * `(width, height)` - Output dimensions
///
/// # Examples
/// ```
/// # use proofsheet::imaging::calculate_fit_dimensions;
/// // 2000x1500 landscape, 1000 on the longer edge → 1000x750
/// assert_eq!(calculate_fit_dimensions((2000, 1500), 1000), (1000, 750));
///
/// // Smaller than the target: untouched
/// assert_eq!(calculate_fit_dimensions((500, 400), 1000), (500, 400));
/// ```
pub fn calculate_fit_dimensions(original: (u32, u32), target: u32) -> (u32, u32) {
    let (orig_w, orig_h) = original;
    let longer_edge = orig_w.max(orig_h);

    if target == 0 || longer_edge <= target {
        return original;
    }

    let ratio = target as f64 / longer_edge as f64;
    if orig_w >= orig_h {
        // Landscape or square
        let h = ((orig_h as f64 * ratio).round() as u32).max(1);
        (target, h)
    } else {
        // Portrait
        let w = ((orig_w as f64 * ratio).round() as u32).max(1);
        (w, target)
    }
}

/// True when a render at `target` would change the pixel dimensions.
pub fn needs_resize(original: (u32, u32), target: u32) -> bool {
    calculate_fit_dimensions(original, target) != original
}
