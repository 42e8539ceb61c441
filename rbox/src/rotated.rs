use crate::{common::*, Point, Polygon};

/// Oriented box with its rotation encoded as the (sin, cos) pair of the
/// yaw angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedBox<T> {
    pub cx: T,
    pub cy: T,
    pub w: T,
    pub h: T,
    pub im: T,
    pub re: T,
}

impl<T> RotatedBox<T>
where
    T: Float,
{
    pub fn try_new(cx: T, cy: T, w: T, h: T, im: T, re: T) -> Result<Self> {
        ensure!(
            w >= T::zero() && h >= T::zero(),
            "box width and height must be non-negative"
        );
        Ok(Self {
            cx,
            cy,
            w,
            h,
            im,
            re,
        })
    }

    pub fn new(cx: T, cy: T, w: T, h: T, im: T, re: T) -> Self {
        Self::try_new(cx, cy, w, h, im, re).unwrap()
    }

    pub fn yaw(&self) -> T {
        self.im.atan2(self.re)
    }

    /// The four rotated corners around the box center.
    pub fn to_polygon(&self) -> Polygon<T> {
        self.to_polygon_at(Point::new(self.cx, self.cy))
    }

    /// The four rotated corners around `reference` instead of the box
    /// center. Shape-only comparisons anchor every box at one shared
    /// reference point.
    pub fn to_polygon_at(&self, reference: Point<T>) -> Polygon<T> {
        let two = T::one() + T::one();
        let yaw = self.yaw();
        let cos = yaw.cos();
        let sin = yaw.sin();
        let half_w = self.w / two;
        let half_h = self.h / two;

        let vertices = [
            (half_w, half_h),
            (-half_w, half_h),
            (-half_w, -half_h),
            (half_w, -half_h),
        ]
        .iter()
        .map(|&(rel_x, rel_y)| {
            Point::new(
                reference.x + rel_x * cos - rel_y * sin,
                reference.y + rel_x * sin + rel_y * cos,
            )
        })
        .collect();

        Polygon::new(vertices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_4;

    #[test]
    fn yaw_from_im_re() {
        let aligned = RotatedBox::new(0.0, 0.0, 2.0, 1.0, 0.0, 1.0);
        assert_abs_diff_eq!(aligned.yaw(), 0.0);

        let tilted = RotatedBox::new(
            0.0,
            0.0,
            2.0,
            1.0,
            FRAC_PI_4.sin(),
            FRAC_PI_4.cos(),
        );
        assert_abs_diff_eq!(tilted.yaw(), FRAC_PI_4, epsilon = 1e-9);
    }

    #[test]
    fn polygon_area_is_rotation_invariant() {
        let aligned = RotatedBox::new(3.0, 4.0, 2.0, 1.0, 0.0, 1.0);
        let tilted = RotatedBox::new(3.0, 4.0, 2.0, 1.0, 0.3f64.sin(), 0.3f64.cos());
        assert_abs_diff_eq!(aligned.to_polygon().area(), 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(tilted.to_polygon().area(), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn quarter_turn_swaps_extents() {
        // a 4x2 box rotated by 90 degrees covers the extents of a 2x4 box
        let quarter = RotatedBox::new(0.0, 0.0, 4.0, 2.0, 1.0, 0.0);
        let swapped = RotatedBox::new(0.0, 0.0, 2.0, 4.0, 0.0, 1.0);
        let iou = quarter.to_polygon().iou_with(&swapped.to_polygon());
        assert_abs_diff_eq!(iou, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn rejects_negative_extents() {
        assert!(RotatedBox::try_new(0.0, 0.0, -1.0, 1.0, 0.0, 1.0).is_err());
    }
}
