use crate::common::*;
use rbox::{Point, ShapePolygon};

/// Shared reference center of shape-only polygons. Anchoring every shape
/// at the same positive coordinate keeps polygon vertices away from the
/// origin regardless of box extent.
pub const SHAPE_REFERENCE: f64 = 100.0;

/// Anchor prior in original image pixels: width, height and the
/// (sin, cos) rotation prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, CopyGetters)]
pub struct RotAnchor {
    #[get_copy = "pub"]
    w: R64,
    #[get_copy = "pub"]
    h: R64,
    #[get_copy = "pub"]
    im: R64,
    #[get_copy = "pub"]
    re: R64,
}

impl RotAnchor {
    pub fn try_new(w: f64, h: f64, im: f64, re: f64) -> Result<Self> {
        let w = R64::try_new(w).ok_or_else(|| format_err!("anchor width must be a number"))?;
        let h = R64::try_new(h).ok_or_else(|| format_err!("anchor height must be a number"))?;
        let im = R64::try_new(im).ok_or_else(|| format_err!("anchor im must be a number"))?;
        let re = R64::try_new(re).ok_or_else(|| format_err!("anchor re must be a number"))?;
        ensure!(
            w.raw() > 0.0 && h.raw() > 0.0,
            "anchor width and height must be positive, got {}x{}",
            w,
            h
        );
        Ok(Self { w, h, im, re })
    }

    pub fn new(w: f64, h: f64, im: f64, re: f64) -> Self {
        Self::try_new(w, h, im, re).unwrap()
    }
}

/// Anchor priors divided by the feature-map stride, paired with the
/// rotated polygon and area of every scaled anchor.
#[derive(Debug, Getters, CopyGetters)]
pub struct ScaledAnchors {
    #[get_copy = "pub"]
    stride: f64,
    /// `(num_anchors, 4)` rows of `(w, h, im, re)` in grid units.
    #[get = "pub"]
    tensor: Tensor,
    #[get = "pub"]
    sizes: Vec<[f32; 4]>,
    #[get = "pub"]
    polygons: Vec<ShapePolygon<f32>>,
}

impl ScaledAnchors {
    pub fn new(anchors: &[RotAnchor], stride: f64, device: Device) -> Result<Self> {
        ensure!(
            stride.is_finite() && stride > 0.0,
            "stride must be positive and finite, got {}",
            stride
        );
        ensure!(!anchors.is_empty(), "at least one anchor is required");

        let sizes: Vec<[f32; 4]> = anchors
            .iter()
            .map(|anchor| {
                [
                    (anchor.w().raw() / stride) as f32,
                    (anchor.h().raw() / stride) as f32,
                    anchor.im().raw() as f32,
                    anchor.re().raw() as f32,
                ]
            })
            .collect();

        let reference = Point::new(SHAPE_REFERENCE as f32, SHAPE_REFERENCE as f32);
        let polygons = rbox::shape_polygons(&sizes, reference);

        let flat: Vec<f32> = sizes.iter().flatten().copied().collect();
        let tensor = Tensor::of_slice(&flat)
            .view([anchors.len() as i64, 4])
            .set_requires_grad(false)
            .to_device(device);

        Ok(Self {
            stride,
            tensor,
            sizes,
            polygons,
        })
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn anchors_scale_by_stride() -> Result<()> {
        let anchors = vec![
            RotAnchor::new(16.0, 8.0, 0.0, 1.0),
            RotAnchor::new(32.0, 32.0, 1.0, 0.0),
        ];
        let scaled = ScaledAnchors::new(&anchors, 8.0, Device::Cpu)?;

        assert_eq!(scaled.len(), 2);
        assert_eq!(scaled.sizes()[0], [2.0, 1.0, 0.0, 1.0]);
        assert_eq!(scaled.sizes()[1], [4.0, 4.0, 1.0, 0.0]);
        assert_eq!(scaled.tensor().size(), vec![2, 4]);

        // im/re pass through unscaled, polygon areas follow the grid sizes
        assert_abs_diff_eq!(scaled.polygons()[0].area, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(scaled.polygons()[1].area, 16.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn rejects_invalid_configurations() {
        assert!(RotAnchor::try_new(0.0, 8.0, 0.0, 1.0).is_err());
        assert!(RotAnchor::try_new(8.0, 8.0, f64::NAN, 1.0).is_err());

        let anchors = vec![RotAnchor::new(16.0, 8.0, 0.0, 1.0)];
        assert!(ScaledAnchors::new(&anchors, 0.0, Device::Cpu).is_err());
        assert!(ScaledAnchors::new(&[], 8.0, Device::Cpu).is_err());
    }
}
