use crate::{
    anchor::{RotAnchor, ScaledAnchors},
    common::*,
    loss::{YoloRotLoss, YoloRotLossInit, YoloRotLossOutput},
    target::TargetBuilder,
};

#[derive(Debug, Clone)]
pub struct YoloRotLayerInit {
    pub num_classes: usize,
    pub anchors: Vec<RotAnchor>,
    pub ignore_thresh: R64,
    pub loss: YoloRotLossInit,
}

impl YoloRotLayerInit {
    pub fn build(self) -> Result<YoloRotLayer> {
        let Self {
            num_classes,
            anchors,
            ignore_thresh,
            loss,
        } = self;

        ensure!(num_classes >= 1, "num_classes must be at least 1");
        ensure!(!anchors.is_empty(), "at least one anchor is required");
        let ignore_thresh = ignore_thresh.raw();
        ensure!(
            (0.0..=1.0).contains(&ignore_thresh),
            "ignore_thresh must be in range [0, 1]"
        );

        let loss = loss.build()?;

        Ok(YoloRotLayer {
            num_classes,
            anchors,
            ignore_thresh,
            loss,
            cache: None,
            seen: 0,
        })
    }
}

/// Rotated-box detection head over one feature map.
///
/// Decodes raw per-cell activations into absolute oriented boxes and,
/// during training, assigns ground-truth boxes to anchors and computes
/// the composite loss. Grid geometry is cached and rebuilt only when the
/// feature-map resolution changes.
#[derive(Debug, Getters, CopyGetters)]
pub struct YoloRotLayer {
    #[get_copy = "pub"]
    num_classes: usize,
    #[get = "pub"]
    anchors: Vec<RotAnchor>,
    #[get_copy = "pub"]
    ignore_thresh: f64,
    loss: YoloRotLoss,
    cache: Option<GridCache>,
    /// Running count of samples seen across forward passes.
    #[get_copy = "pub"]
    seen: i64,
}

impl YoloRotLayer {
    /// Decodes one feature map and, when targets are given, computes the
    /// training loss.
    ///
    /// The input has shape `(batch, num_anchors * (7 + num_classes),
    /// grid, grid)` with per-anchor channel blocks of
    /// `(x, y, w, h, im, re, objectness, classes..)`. Targets are
    /// `(num_boxes, 8)` rows of `(batch_index, class, cx, cy, w, h, im,
    /// re)` with geometry normalized to `[0, 1]`. Returns the flat
    /// `(batch, num_anchors * grid * grid, 7 + num_classes)` detection
    /// tensor and, in training, the loss.
    pub fn forward(
        &mut self,
        input: &Tensor,
        targets: Option<&Tensor>,
        img_size: i64,
    ) -> Result<(Tensor, Option<YoloRotLossOutput>)> {
        let num_anchors = self.anchors.len() as i64;
        let num_classes = self.num_classes as i64;
        let num_entries = 7 + num_classes;

        let (batch_size, channels, feature_h, feature_w) = input
            .size4()
            .context("the input feature map must be a 4-dimensional tensor")?;
        ensure!(
            feature_h == feature_w,
            "feature maps must be square, got {}x{}",
            feature_h,
            feature_w
        );
        ensure!(
            channels == num_anchors * num_entries,
            "channel count {} does not match {} anchors * (7 + {} classes)",
            channels,
            num_anchors,
            num_classes
        );
        let grid_size = feature_w;

        self.ensure_cache(input.device(), grid_size, img_size)?;
        let cache = self.cache.as_ref().unwrap();

        // split channels per anchor block, then move them last
        let prediction = input
            .view([batch_size, num_anchors, num_entries, grid_size, grid_size])
            .permute(&[0, 1, 3, 4, 2])
            .contiguous();

        let pred_x = prediction.i((.., .., .., .., 0)).sigmoid();
        let pred_y = prediction.i((.., .., .., .., 1)).sigmoid();
        let pred_w = prediction.i((.., .., .., .., 2));
        let pred_h = prediction.i((.., .., .., .., 3));
        let pred_im = prediction.i((.., .., .., .., 4));
        let pred_re = prediction.i((.., .., .., .., 5));
        let pred_conf = prediction.i((.., .., .., .., 6)).sigmoid();
        let pred_cls = prediction.i((.., .., .., .., 7..)).sigmoid();

        // absolute boxes in grid units; the decode path carries no
        // gradient, localization learns from the regression targets
        let out_boxes = {
            let out_cx = pred_x.detach() + &cache.grid_x;
            let out_cy = pred_y.detach() + &cache.grid_y;
            let out_w = pred_w.detach().exp() * &cache.anchor_w;
            let out_h = pred_h.detach().exp() * &cache.anchor_h;
            Tensor::stack(
                &[
                    &out_cx,
                    &out_cy,
                    &out_w,
                    &out_h,
                    &pred_im.detach(),
                    &pred_re.detach(),
                ],
                -1,
            )
        };

        let output = Tensor::cat(
            &[
                out_boxes.i((.., .., .., .., 0..4)).reshape(&[batch_size, -1, 4]) * cache.stride,
                out_boxes.i((.., .., .., .., 4..6)).reshape(&[batch_size, -1, 2]),
                pred_conf.reshape(&[batch_size, -1, 1]),
                pred_cls.reshape(&[batch_size, -1, num_classes]),
            ],
            -1,
        );

        self.seen += batch_size;

        let targets = match targets {
            Some(targets) => targets,
            None => return Ok((output, None)),
        };

        let built = TargetBuilder {
            ignore_thresh: self.ignore_thresh,
            grid_size,
            scaled_anchors: &cache.scaled_anchors,
        }
        .build(&out_boxes, &pred_cls, targets)?;
        let loss = self.loss.forward(&pred_conf, &pred_cls, &built)?;

        Ok((output, Some(loss)))
    }

    fn ensure_cache(&mut self, device: Device, grid_size: i64, img_size: i64) -> Result<()> {
        let is_hit = self
            .cache
            .as_ref()
            .map(|cache| !cache.is_stale(grid_size))
            .unwrap_or(false);

        if is_hit {
            let cache = self.cache.as_ref().unwrap();
            ensure!(
                cache.device == device,
                "the cached grid geometry lives on {:?} but the input is on {:?}",
                cache.device,
                device
            );
            ensure!(
                cache.img_size == img_size,
                "img_size changed from {} to {} at unchanged grid size {}",
                cache.img_size,
                img_size,
                grid_size
            );
            return Ok(());
        }

        let cache = GridCache::build(&self.anchors, grid_size, img_size, device)?;
        info!(
            "grid geometry rebuilt: grid size {}, stride {}",
            grid_size, cache.stride
        );
        for (index, size) in cache.scaled_anchors.sizes().iter().enumerate() {
            info!(
                "  - anchor {}\t{}x{} (grid units)",
                index, size[0], size[1]
            );
        }
        self.cache = Some(cache);
        Ok(())
    }
}

/// Grid-size-dependent geometry, rebuilt when the feature-map resolution
/// changes.
#[derive(Debug)]
struct GridCache {
    grid_size: i64,
    img_size: i64,
    stride: f64,
    device: Device,
    grid_x: Tensor,
    grid_y: Tensor,
    anchor_w: Tensor,
    anchor_h: Tensor,
    scaled_anchors: ScaledAnchors,
}

impl GridCache {
    fn is_stale(&self, grid_size: i64) -> bool {
        self.grid_size != grid_size
    }

    fn build(anchors: &[RotAnchor], grid_size: i64, img_size: i64, device: Device) -> Result<Self> {
        ensure!(grid_size > 0, "grid_size must be positive, got {}", grid_size);
        ensure!(img_size > 0, "img_size must be positive, got {}", img_size);

        tch::no_grad(|| -> Result<Self> {
            let stride = img_size as f64 / grid_size as f64;

            let grid_x = Tensor::arange(grid_size, (Kind::Float, device))
                .repeat(&[grid_size, 1])
                .view([1, 1, grid_size, grid_size])
                .set_requires_grad(false);
            let grid_y = Tensor::arange(grid_size, (Kind::Float, device))
                .repeat(&[grid_size, 1])
                .transpose(0, 1)
                .contiguous()
                .view([1, 1, grid_size, grid_size])
                .set_requires_grad(false);

            let scaled_anchors = ScaledAnchors::new(anchors, stride, device)?;

            let num_anchors = anchors.len() as i64;
            let (anchor_w_vec, anchor_h_vec) = scaled_anchors
                .sizes()
                .iter()
                .map(|&[w, h, _im, _re]| (w, h))
                .unzip_n_vec();
            let anchor_w = Tensor::of_slice(&anchor_w_vec)
                .view([1, num_anchors, 1, 1])
                .set_requires_grad(false)
                .to_device(device);
            let anchor_h = Tensor::of_slice(&anchor_h_vec)
                .view([1, num_anchors, 1, 1])
                .set_requires_grad(false)
                .to_device(device);

            Ok(Self {
                grid_size,
                img_size,
                stride,
                device,
                grid_x,
                grid_y,
                anchor_w,
                anchor_h,
                scaled_anchors,
            })
        })
    }
}
