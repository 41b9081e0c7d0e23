//! Mask compositor: union of accepted region masks.

use image::Luma;

use crate::types::{CandidateRegion, Dimensions, GrayImage, MASK_ON};

/// OR the masks of every accepted region onto a blank canvas of size
/// `canvas`.
///
/// Regions without an accepted verdict contribute nothing. Mask pixels
/// falling outside the canvas are ignored.
#[must_use = "returns the composed mask"]
pub fn compose(regions: &[CandidateRegion], canvas: Dimensions) -> GrayImage {
    let mut out = GrayImage::new(canvas.width, canvas.height);
    for region in regions.iter().filter(|r| r.is_accepted()) {
        paint(&mut out, region);
    }
    out
}

fn paint(out: &mut GrayImage, region: &CandidateRegion) {
    let (width, height) = out.dimensions();
    for (x, y, p) in region.mask.enumerate_pixels() {
        if p.0[0] == 0 {
            continue;
        }
        let gx = i64::from(region.bbox.x) + i64::from(x);
        let gy = i64::from(region.bbox.y) + i64::from(y);
        let (Ok(gx), Ok(gy)) = (u32::try_from(gx), u32::try_from(gy)) else {
            continue;
        };
        if gx < width && gy < height {
            out.put_pixel(gx, gy, Luma([MASK_ON]));
        }
    }
}
