use crate::band::ColorBand;
use anyhow::{Context, Result};
use opencv::{
    core::{self, Mat, Point},
    imgproc,
};

const MORPH_ITERATIONS: i32 = 2;

/// Converts a BGR frame to HSV. Done once per frame and shared by both bands.
pub fn to_hsv(frame: &Mat) -> Result<Mat> {
    let mut hsv = Mat::default();
    imgproc::cvt_color(
        frame,
        &mut hsv,
        imgproc::COLOR_BGR2HSV,
        0,
        core::AlgorithmHint::ALGO_HINT_DEFAULT,
    )
    .context("Failed to convert to HSV")?;
    Ok(hsv)
}

/// Binary mask of the pixels whose three HSV channels fall inside `band`
/// (inclusive), opened with two erosions and two dilations.
pub fn build_mask(hsv: &Mat, band: &ColorBand) -> Result<Mat> {
    let mut in_band = Mat::default();
    core::in_range(hsv, &band.lower_scalar(), &band.upper_scalar(), &mut in_band)
        .context("Failed to compute in-range mask")?;

    let mut binary = Mat::default();
    imgproc::threshold(&in_band, &mut binary, 100.0, 255.0, imgproc::THRESH_BINARY)
        .context("Failed to threshold mask")?;

    // An empty kernel selects the default 3x3 rectangle.
    let kernel = Mat::default();
    let anchor = Point::new(-1, -1);
    let mut eroded = Mat::default();
    imgproc::erode(
        &binary,
        &mut eroded,
        &kernel,
        anchor,
        MORPH_ITERATIONS,
        core::BORDER_CONSTANT,
        imgproc::morphology_default_border_value()?,
    )
    .context("Failed to erode mask")?;

    let mut mask = Mat::default();
    imgproc::dilate(
        &eroded,
        &mut mask,
        &kernel,
        anchor,
        MORPH_ITERATIONS,
        core::BORDER_CONSTANT,
        imgproc::morphology_default_border_value()?,
    )
    .context("Failed to dilate mask")?;

    Ok(mask)
}
