use crate::{
    anchor::{ScaledAnchors, SHAPE_REFERENCE},
    common::*,
};
use rbox::{Point, RotatedBox};

/// Dense per-cell training targets. Every tensor is shaped
/// `(batch, num_anchors, grid, grid)`; `tcls` carries a trailing class
/// dimension.
#[derive(Debug, TensorLike)]
pub struct RotTargets {
    pub obj_mask: Tensor,
    pub noobj_mask: Tensor,
    pub tx: Tensor,
    pub ty: Tensor,
    pub tw: Tensor,
    pub th: Tensor,
    pub tim: Tensor,
    pub tre: Tensor,
    pub tcls: Tensor,
    pub tconf: Tensor,
    pub iou_scores: Tensor,
    pub class_mask: Tensor,
}

/// One ground-truth row parsed into grid units.
#[derive(Debug)]
struct GtBox {
    batch: i64,
    label: i64,
    gx: f32,
    gy: f32,
    gw: f32,
    gh: f32,
    im: f32,
    re: f32,
    row: i64,
    col: i64,
}

/// Matches ground-truth boxes to their best anchors with rotated-polygon
/// IoU and scatters the per-slot training targets.
#[derive(Debug)]
pub struct TargetBuilder<'a> {
    pub ignore_thresh: f64,
    pub grid_size: i64,
    pub scaled_anchors: &'a ScaledAnchors,
}

impl TargetBuilder<'_> {
    /// `out_boxes` are the decoded `(batch, num_anchors, grid, grid, 6)`
    /// predictions in grid units, `pred_cls` the class scores with a
    /// trailing class dimension, `targets` the `(num_boxes, 8)` rows of
    /// `(batch_index, class, cx, cy, w, h, im, re)` with geometry
    /// normalized to `[0, 1]`.
    pub fn build(
        &self,
        out_boxes: &Tensor,
        pred_cls: &Tensor,
        targets: &Tensor,
    ) -> Result<RotTargets> {
        let Self {
            ignore_thresh,
            grid_size,
            scaled_anchors,
        } = *self;
        let device = pred_cls.device();
        let num_anchors = scaled_anchors.len() as i64;

        let (num_samples, num_classes) = match pred_cls.size().as_slice() {
            &[b, a, gh, gw, c] if a == num_anchors && gh == grid_size && gw == grid_size => (b, c),
            shape => bail!("unexpected class prediction shape {:?}", shape),
        };

        let (num_boxes, num_cols) = targets.size2()?;
        ensure!(
            num_cols == 8,
            "target rows must have 8 entries, got {}",
            num_cols
        );

        tch::no_grad(|| -> Result<RotTargets> {
            let mask_shape = [num_samples, num_anchors, grid_size, grid_size];
            let mut obj_mask = Tensor::zeros(&mask_shape, (Kind::Bool, device));
            let mut noobj_mask = Tensor::ones(&mask_shape, (Kind::Bool, device));
            let mut tx = Tensor::zeros(&mask_shape, (Kind::Float, device));
            let mut ty = Tensor::zeros(&mask_shape, (Kind::Float, device));
            let mut tw = Tensor::zeros(&mask_shape, (Kind::Float, device));
            let mut th = Tensor::zeros(&mask_shape, (Kind::Float, device));
            let mut tim = Tensor::zeros(&mask_shape, (Kind::Float, device));
            let mut tre = Tensor::zeros(&mask_shape, (Kind::Float, device));
            let mut iou_scores = Tensor::zeros(&mask_shape, (Kind::Float, device));
            let mut class_mask = Tensor::zeros(&mask_shape, (Kind::Float, device));
            let mut tcls = Tensor::zeros(
                &[num_samples, num_anchors, grid_size, grid_size, num_classes],
                (Kind::Float, device),
            );

            // an image without objects is valid and keeps the all-negative
            // state
            if num_boxes == 0 {
                let tconf = obj_mask.to_kind(Kind::Float);
                return Ok(RotTargets {
                    obj_mask,
                    noobj_mask,
                    tx,
                    ty,
                    tw,
                    th,
                    tim,
                    tre,
                    tcls,
                    tconf,
                    iou_scores,
                    class_mask,
                });
            }

            let rows = Vec::<f32>::from(
                &targets
                    .to_device(Device::Cpu)
                    .to_kind(Kind::Float)
                    .contiguous(),
            );

            let grid = grid_size as f32;
            let boxes: Vec<GtBox> = rows
                .chunks(8)
                .enumerate()
                .map(|(index, chunk)| {
                    let batch = chunk[0] as i64;
                    let label = chunk[1] as i64;
                    ensure!(
                        (0..num_samples).contains(&batch),
                        "target {} batch index {} is out of range for batch size {}",
                        index,
                        batch,
                        num_samples
                    );
                    ensure!(
                        (0..num_classes).contains(&label),
                        "target {} class {} is out of range for {} classes",
                        index,
                        label,
                        num_classes
                    );

                    let gx = chunk[2] * grid;
                    let gy = chunk[3] * grid;
                    let gw = chunk[4] * grid;
                    let gh = chunk[5] * grid;
                    let im = chunk[6];
                    let re = chunk[7];
                    ensure!(
                        gw >= 0.0 && gh >= 0.0,
                        "target {} extent {}x{} must be non-negative",
                        index,
                        gw,
                        gh
                    );

                    if abs_diff_eq!(gw, 0.0) || abs_diff_eq!(gh, 0.0) {
                        warn!(
                            "target {} shrinks to {}x{} grid units and may regress poorly",
                            index, gw, gh
                        );
                    }

                    let col = gx.floor() as i64;
                    let row = gy.floor() as i64;
                    ensure!(
                        (0..grid_size).contains(&col) && (0..grid_size).contains(&row),
                        "target {} center ({}, {}) lies outside the {}x{} grid",
                        index,
                        gx,
                        gy,
                        grid_size,
                        grid_size
                    );

                    Ok(GtBox {
                        batch,
                        label,
                        gx,
                        gy,
                        gw,
                        gh,
                        im,
                        re,
                        row,
                        col,
                    })
                })
                .collect::<Result<_>>()?;

            // rotated IoU of every target shape against every anchor shape
            let shapes: Vec<[f32; 4]> = boxes
                .iter()
                .map(|gt| [gt.gw, gt.gh, gt.im, gt.re])
                .collect();
            let reference = Point::new(SHAPE_REFERENCE as f32, SHAPE_REFERENCE as f32);
            let target_polygons = rbox::shape_polygons(&shapes, reference);
            let ious = rbox::iou_boxes_vs_anchors(&target_polygons, scaled_anchors.polygons());

            // best anchor per target; a later target overwrites an earlier
            // one colliding on the same slot
            let best_anchors: Vec<usize> = (0..boxes.len())
                .map(|index| ious.best_col(index).0)
                .collect();
            let mut slots: IndexMap<(i64, i64, i64, i64), usize> = IndexMap::new();
            for (index, gt) in boxes.iter().enumerate() {
                slots.insert((gt.batch, best_anchors[index] as i64, gt.row, gt.col), index);
            }

            let (batch_vec, anchor_vec, row_vec, col_vec) = slots
                .keys()
                .map(|&(batch, anchor, row, col)| (batch, anchor, row, col))
                .unzip_n_vec();
            let slot_batches = Tensor::of_slice(&batch_vec).to_device(device);
            let slot_anchors = Tensor::of_slice(&anchor_vec).to_device(device);
            let slot_rows = Tensor::of_slice(&row_vec).to_device(device);
            let slot_cols = Tensor::of_slice(&col_vec).to_device(device);
            let slot_indexes = [
                Some(&slot_batches),
                Some(&slot_anchors),
                Some(&slot_rows),
                Some(&slot_cols),
            ];
            let num_slots = slots.len() as i64;

            let _ = obj_mask.index_put_(
                &slot_indexes,
                &Tensor::ones(&[num_slots], (Kind::Bool, device)),
                false,
            );
            let _ = noobj_mask.index_put_(
                &slot_indexes,
                &Tensor::zeros(&[num_slots], (Kind::Bool, device)),
                false,
            );

            // regression targets: sub-cell offsets and log-space extents
            let epsilon = rbox::EPSILON as f32;
            let (tx_vec, ty_vec, tw_vec, th_vec, tim_vec, tre_vec) = slots
                .values()
                .map(|&index| {
                    let gt = &boxes[index];
                    let [anchor_w, anchor_h, _im, _re] =
                        scaled_anchors.sizes()[best_anchors[index]];
                    (
                        gt.gx - gt.gx.floor(),
                        gt.gy - gt.gy.floor(),
                        (gt.gw / anchor_w + epsilon).ln(),
                        (gt.gh / anchor_h + epsilon).ln(),
                        gt.im,
                        gt.re,
                    )
                })
                .unzip_n_vec();
            let _ = tx.index_put_(
                &slot_indexes,
                &Tensor::of_slice(&tx_vec).to_device(device),
                false,
            );
            let _ = ty.index_put_(
                &slot_indexes,
                &Tensor::of_slice(&ty_vec).to_device(device),
                false,
            );
            let _ = tw.index_put_(
                &slot_indexes,
                &Tensor::of_slice(&tw_vec).to_device(device),
                false,
            );
            let _ = th.index_put_(
                &slot_indexes,
                &Tensor::of_slice(&th_vec).to_device(device),
                false,
            );
            let _ = tim.index_put_(
                &slot_indexes,
                &Tensor::of_slice(&tim_vec).to_device(device),
                false,
            );
            let _ = tre.index_put_(
                &slot_indexes,
                &Tensor::of_slice(&tre_vec).to_device(device),
                false,
            );

            // one-hot class targets
            let label_vec: Vec<i64> = slots.values().map(|&index| boxes[index].label).collect();
            let slot_labels = Tensor::of_slice(&label_vec).to_device(device);
            let _ = tcls.index_put_(
                &[
                    Some(&slot_batches),
                    Some(&slot_anchors),
                    Some(&slot_rows),
                    Some(&slot_cols),
                    Some(&slot_labels),
                ],
                &Tensor::ones(&[num_slots], (Kind::Float, device)),
                false,
            );

            // classification correctness at the assigned slots
            let correct = pred_cls
                .index(&slot_indexes)
                .argmax(-1, false)
                .eq_tensor(&slot_labels)
                .to_kind(Kind::Float);
            let _ = class_mask.index_put_(&slot_indexes, &correct, false);

            // rotated IoU of the decoded boxes against their targets
            let pred_rows = Vec::<f32>::from(
                &out_boxes
                    .index(&slot_indexes)
                    .to_device(Device::Cpu)
                    .contiguous(),
            );
            let pred_boxes: Vec<RotatedBox<f32>> = pred_rows
                .chunks(6)
                .map(|chunk| {
                    RotatedBox::try_new(chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5])
                })
                .collect::<Result<_>>()?;
            let gt_boxes: Vec<RotatedBox<f32>> = slots
                .values()
                .map(|&index| {
                    let gt = &boxes[index];
                    RotatedBox::new(gt.gx, gt.gy, gt.gw, gt.gh, gt.im, gt.re)
                })
                .collect();
            let slot_ious = rbox::iou_pred_vs_target(&pred_boxes, &gt_boxes)?;
            let _ = iou_scores.index_put_(
                &slot_indexes,
                &Tensor::of_slice(&slot_ious).to_device(device),
                false,
            );

            // every anchor overlapping a target above the ignore threshold
            // is excluded from the no-object loss at that target's cell;
            // clears from different targets accumulate
            let (ignore_batches, ignore_anchors, ignore_rows, ignore_cols) = boxes
                .iter()
                .enumerate()
                .flat_map(|(index, gt)| {
                    ious.row(index)
                        .iter()
                        .enumerate()
                        .filter(|&(_anchor, &iou)| f64::from(iou) > ignore_thresh)
                        .map(move |(anchor, _iou)| (gt.batch, anchor as i64, gt.row, gt.col))
                        .collect::<Vec<_>>()
                })
                .unzip_n_vec();
            if !ignore_batches.is_empty() {
                let ignore_len = ignore_batches.len() as i64;
                let _ = noobj_mask.index_put_(
                    &[
                        Some(&Tensor::of_slice(&ignore_batches).to_device(device)),
                        Some(&Tensor::of_slice(&ignore_anchors).to_device(device)),
                        Some(&Tensor::of_slice(&ignore_rows).to_device(device)),
                        Some(&Tensor::of_slice(&ignore_cols).to_device(device)),
                    ],
                    &Tensor::zeros(&[ignore_len], (Kind::Bool, device)),
                    false,
                );
            }

            let tconf = obj_mask.to_kind(Kind::Float);

            Ok(RotTargets {
                obj_mask,
                noobj_mask,
                tx,
                ty,
                tw,
                th,
                tim,
                tre,
                tcls,
                tconf,
                iou_scores,
                class_mask,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::RotAnchor;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_4;

    fn mask_count(mask: &Tensor) -> i64 {
        i64::from(&mask.to_kind(Kind::Int64).sum(Kind::Int64))
    }

    fn zero_predictions(num_anchors: i64, grid_size: i64, num_classes: i64) -> (Tensor, Tensor) {
        let out_boxes = Tensor::zeros(
            &[1, num_anchors, grid_size, grid_size, 6],
            (Kind::Float, Device::Cpu),
        );
        let pred_cls = Tensor::zeros(
            &[1, num_anchors, grid_size, grid_size, num_classes],
            (Kind::Float, Device::Cpu),
        );
        (out_boxes, pred_cls)
    }

    #[test]
    fn empty_targets_keep_the_negative_state() -> Result<()> {
        let anchors = vec![RotAnchor::new(10.0, 10.0, 0.0, 1.0)];
        let scaled = ScaledAnchors::new(&anchors, 10.0, Device::Cpu)?;
        let builder = TargetBuilder {
            ignore_thresh: 0.5,
            grid_size: 4,
            scaled_anchors: &scaled,
        };
        let (out_boxes, pred_cls) = zero_predictions(1, 4, 3);
        let targets = Tensor::zeros(&[0, 8], (Kind::Float, Device::Cpu));

        let built = builder.build(&out_boxes, &pred_cls, &targets)?;

        ensure!(mask_count(&built.obj_mask) == 0, "no slot may be assigned");
        ensure!(
            mask_count(&built.noobj_mask) == 16,
            "every slot must stay negative"
        );
        ensure!(
            f64::from(&built.tconf.sum(Kind::Float)) == 0.0,
            "confidence targets must be zero"
        );
        Ok(())
    }

    #[test]
    fn best_anchor_wins_the_assignment() -> Result<()> {
        // IoU against the 1x1 target shape: anchor 0 scores 1.0, anchor 1
        // scores 0.5, anchor 2 (rotated 45 degrees) scores 2(sqrt(2) - 1)
        let anchors = vec![
            RotAnchor::new(10.0, 10.0, 0.0, 1.0),
            RotAnchor::new(20.0, 10.0, 0.0, 1.0),
            RotAnchor::new(10.0, 10.0, FRAC_PI_4.sin(), FRAC_PI_4.cos()),
        ];
        let scaled = ScaledAnchors::new(&anchors, 10.0, Device::Cpu)?;
        let builder = TargetBuilder {
            ignore_thresh: 0.99,
            grid_size: 4,
            scaled_anchors: &scaled,
        };
        let (out_boxes, pred_cls) = zero_predictions(3, 4, 3);
        let targets = Tensor::of_slice(&[0.0f32, 1.0, 0.5, 0.5, 0.25, 0.25, 0.0, 1.0]).view([1, 8]);

        let built = builder.build(&out_boxes, &pred_cls, &targets)?;

        ensure!(mask_count(&built.obj_mask) == 1, "exactly one assigned slot");
        ensure!(
            bool::from(&built.obj_mask.i((0, 0, 2, 2))),
            "the aligned square anchor must win"
        );

        // sub-cell offsets vanish for a centered box, extents match the
        // anchor exactly
        assert_abs_diff_eq!(f64::from(&built.tx.i((0, 0, 2, 2))), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(&built.ty.i((0, 0, 2, 2))), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(&built.tw.i((0, 0, 2, 2))), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(&built.th.i((0, 0, 2, 2))), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(&built.tre.i((0, 0, 2, 2))), 1.0, epsilon = 1e-6);
        ensure!(
            f64::from(&built.tcls.i((0, 0, 2, 2, 1))) == 1.0,
            "one-hot class target must be set"
        );
        ensure!(
            f64::from(&built.tconf.sum(Kind::Float)) == 1.0,
            "confidence targets follow the object mask"
        );
        Ok(())
    }

    #[test]
    fn high_overlap_anchors_are_ignored_not_penalized() -> Result<()> {
        let anchors = vec![
            RotAnchor::new(10.0, 10.0, 0.0, 1.0),
            RotAnchor::new(12.0, 10.0, 0.0, 1.0),
            RotAnchor::new(3.0, 3.0, 0.0, 1.0),
        ];
        let scaled = ScaledAnchors::new(&anchors, 10.0, Device::Cpu)?;
        let builder = TargetBuilder {
            ignore_thresh: 0.5,
            grid_size: 4,
            scaled_anchors: &scaled,
        };
        let (out_boxes, pred_cls) = zero_predictions(3, 4, 3);
        let targets = Tensor::of_slice(&[0.0f32, 0.0, 0.5, 0.5, 0.25, 0.25, 0.0, 1.0]).view([1, 8]);

        let built = builder.build(&out_boxes, &pred_cls, &targets)?;

        // best match is object-assigned, the 0.83-IoU anchor is merely
        // ignored, the 0.09-IoU anchor keeps its negative slot
        ensure!(bool::from(&built.obj_mask.i((0, 0, 2, 2))));
        ensure!(!bool::from(&built.noobj_mask.i((0, 0, 2, 2))));
        ensure!(!bool::from(&built.obj_mask.i((0, 1, 2, 2))));
        ensure!(!bool::from(&built.noobj_mask.i((0, 1, 2, 2))));
        ensure!(bool::from(&built.noobj_mask.i((0, 2, 2, 2))));
        Ok(())
    }

    #[test]
    fn colliding_targets_resolve_to_the_later_row() -> Result<()> {
        let anchors = vec![RotAnchor::new(10.0, 10.0, 0.0, 1.0)];
        let scaled = ScaledAnchors::new(&anchors, 10.0, Device::Cpu)?;
        let builder = TargetBuilder {
            ignore_thresh: 0.99,
            grid_size: 4,
            scaled_anchors: &scaled,
        };
        let (out_boxes, pred_cls) = zero_predictions(1, 4, 3);

        // both rows land in cell (2, 2) of batch 0 with the only anchor
        let targets = Tensor::of_slice(&[
            0.0f32, 0.0, 0.55, 0.55, 0.25, 0.25, 0.0, 1.0, //
            0.0, 2.0, 0.6, 0.6, 0.2, 0.2, 0.0, 1.0,
        ])
        .view([2, 8]);

        let built = builder.build(&out_boxes, &pred_cls, &targets)?;

        ensure!(
            mask_count(&built.obj_mask) == 1,
            "the colliding rows share one slot"
        );
        assert_abs_diff_eq!(
            f64::from(&built.tx.i((0, 0, 2, 2))),
            0.4,
            epsilon = 1e-5
        );
        assert_abs_diff_eq!(
            f64::from(&built.tw.i((0, 0, 2, 2))),
            (0.8f64 / 1.0).ln(),
            epsilon = 1e-5
        );
        ensure!(
            f64::from(&built.tcls.i((0, 0, 2, 2, 2))) == 1.0,
            "the later row's class wins"
        );
        ensure!(
            f64::from(&built.tcls.i((0, 0, 2, 2, 0))) == 0.0,
            "the earlier row's class is overwritten"
        );
        Ok(())
    }

    #[test]
    fn iou_and_class_scores_are_recorded_per_slot() -> Result<()> {
        let anchors = vec![RotAnchor::new(10.0, 10.0, 0.0, 1.0)];
        let scaled = ScaledAnchors::new(&anchors, 10.0, Device::Cpu)?;
        let builder = TargetBuilder {
            ignore_thresh: 0.99,
            grid_size: 4,
            scaled_anchors: &scaled,
        };
        let (out_boxes, pred_cls) = zero_predictions(1, 4, 3);

        // decoded box at the assigned slot equals the ground truth
        let _ = out_boxes
            .i((0, 0, 2, 2))
            .copy_(&Tensor::of_slice(&[2.2f32, 2.2, 1.0, 1.0, 0.0, 1.0]));

        let targets = Tensor::of_slice(&[0.0f32, 0.0, 0.55, 0.55, 0.25, 0.25, 0.0, 1.0]).view([1, 8]);
        let built = builder.build(&out_boxes, &pred_cls, &targets)?;

        assert_abs_diff_eq!(
            f64::from(&built.iou_scores.i((0, 0, 2, 2))),
            1.0,
            epsilon = 1e-5
        );
        // all-zero class scores argmax to class 0, matching the label
        ensure!(f64::from(&built.class_mask.i((0, 0, 2, 2))) == 1.0);
        Ok(())
    }

    #[test]
    fn rejects_malformed_target_rows() -> Result<()> {
        let anchors = vec![RotAnchor::new(10.0, 10.0, 0.0, 1.0)];
        let scaled = ScaledAnchors::new(&anchors, 10.0, Device::Cpu)?;
        let builder = TargetBuilder {
            ignore_thresh: 0.5,
            grid_size: 4,
            scaled_anchors: &scaled,
        };
        let (out_boxes, pred_cls) = zero_predictions(1, 4, 3);

        let bad_width = Tensor::zeros(&[1, 7], (Kind::Float, Device::Cpu));
        ensure!(builder.build(&out_boxes, &pred_cls, &bad_width).is_err());

        let bad_class = Tensor::of_slice(&[0.0f32, 9.0, 0.5, 0.5, 0.25, 0.25, 0.0, 1.0]).view([1, 8]);
        ensure!(builder.build(&out_boxes, &pred_cls, &bad_class).is_err());

        let bad_batch = Tensor::of_slice(&[3.0f32, 0.0, 0.5, 0.5, 0.25, 0.25, 0.0, 1.0]).view([1, 8]);
        ensure!(builder.build(&out_boxes, &pred_cls, &bad_batch).is_err());
        Ok(())
    }
}
