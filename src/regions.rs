use anyhow::{Context, Result};
use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Vector},
    imgproc,
    prelude::*,
};

pub const DEFAULT_MIN_AREA: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub rect: Rect,
    pub label: String,
    pub color: Scalar,
}

/// Bounding boxes of the external components in `mask` whose enclosed pixel
/// area exceeds `min_area`. Order follows contour enumeration.
pub fn find_regions(mask: &Mat, min_area: f64, label: &str, color: Scalar) -> Result<Vec<Region>> {
    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours(
        mask,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )
    .context("Failed to find contours")?;

    let mut regions = Vec::new();
    for idx in 0..contours.len() {
        let contour = contours.get(idx)?;
        let rect = imgproc::bounding_rect(&contour).context("Failed to compute bounding rect")?;
        let area = enclosed_area(&contours, idx as i32, rect)?;
        if area as f64 <= min_area {
            continue;
        }
        tracing::debug!("Contour detected and labeled: {}, Area: {}", label, area);
        regions.push(Region {
            rect,
            label: label.to_string(),
            color,
        });
    }
    Ok(regions)
}

/// Pixels covered by the filled contour, boundary included. The polygon area
/// from `contour_area` runs through pixel centres and undercounts small blobs.
fn enclosed_area(contours: &Vector<Vector<Point>>, idx: i32, rect: Rect) -> Result<i32> {
    let mut canvas =
        Mat::new_rows_cols_with_default(rect.height, rect.width, core::CV_8UC1, Scalar::all(0.0))?;
    imgproc::draw_contours(
        &mut canvas,
        contours,
        idx,
        Scalar::all(255.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        &core::no_array(),
        i32::MAX,
        Point::new(-rect.x, -rect.y),
    )
    .context("Failed to rasterize contour")?;
    Ok(core::count_non_zero(&canvas)?)
}
