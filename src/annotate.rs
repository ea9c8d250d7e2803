use crate::regions::Region;
use anyhow::Result;
use opencv::{
    core::{Mat, Point, Scalar},
    imgproc,
};

const STROKE: i32 = 2;

pub fn annotate(frame: &mut Mat, regions: &[Region]) -> Result<()> {
    for region in regions {
        imgproc::rectangle(frame, region.rect, region.color, STROKE, imgproc::LINE_8, 0)?;
        let origin = Point::new(region.rect.x, region.rect.y - 10);
        imgproc::put_text(
            frame,
            &region.label,
            origin,
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            region.color,
            STROKE,
            imgproc::LINE_8,
            false,
        )?;
    }
    Ok(())
}

pub fn draw_fps(frame: &mut Mat, fps: f64) -> Result<()> {
    let text = format!("FPS: {}", fps as i64);
    imgproc::put_text(
        frame,
        &text,
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
        STROKE,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}
