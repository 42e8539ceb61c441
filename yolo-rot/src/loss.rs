use crate::{common::*, target::RotTargets};

/// Probability-space binary cross entropy with an empty-input guard for
/// mean reduction.
#[derive(Debug)]
pub struct BceLoss {
    reduction: Reduction,
}

impl BceLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        debug_assert_eq!(
            input.size(),
            target.size(),
            "input and target tensors must have equal shape"
        );
        debug_assert!(
            bool::from(target.ge(0.0).logical_and(&target.le(1.0)).all()),
            "target values must be in range of [0.0, 1.0]"
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if input.numel() == 0 && self.reduction == Reduction::Mean {
            return Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false);
        }

        input.binary_cross_entropy::<Tensor>(target, None, self.reduction)
    }
}

#[derive(Debug, Clone)]
pub struct YoloRotLossInit {
    pub reduction: Reduction,
    pub obj_scale: Option<f64>,
    pub noobj_scale: Option<f64>,
    pub box_loss_weight: Option<f64>,
    pub objectness_loss_weight: Option<f64>,
    pub classification_loss_weight: Option<f64>,
}

impl YoloRotLossInit {
    pub fn build(self) -> Result<YoloRotLoss> {
        let Self {
            reduction,
            obj_scale,
            noobj_scale,
            box_loss_weight,
            objectness_loss_weight,
            classification_loss_weight,
        } = self;

        let obj_scale = obj_scale.unwrap_or(1.0);
        // negatives vastly outnumber positives, suppress them hard
        let noobj_scale = noobj_scale.unwrap_or(100.0);
        let box_loss_weight = box_loss_weight.unwrap_or(1.0);
        let objectness_loss_weight = objectness_loss_weight.unwrap_or(1.0);
        let classification_loss_weight = classification_loss_weight.unwrap_or(1.0);

        ensure!(
            matches!(reduction, Reduction::Mean | Reduction::Sum),
            "reduction {:?} is not supported",
            reduction
        );
        ensure!(obj_scale >= 0.0, "obj_scale must be non-negative");
        ensure!(noobj_scale >= 0.0, "noobj_scale must be non-negative");
        ensure!(
            box_loss_weight >= 0.0,
            "box_loss_weight must be non-negative"
        );
        ensure!(
            objectness_loss_weight >= 0.0,
            "objectness_loss_weight must be non-negative"
        );
        ensure!(
            classification_loss_weight >= 0.0,
            "classification_loss_weight must be non-negative"
        );

        Ok(YoloRotLoss {
            reduction,
            bce: BceLoss::new(reduction),
            obj_scale,
            noobj_scale,
            box_loss_weight,
            objectness_loss_weight,
            classification_loss_weight,
        })
    }
}

impl Default for YoloRotLossInit {
    fn default() -> Self {
        Self {
            reduction: Reduction::Mean,
            obj_scale: None,
            noobj_scale: None,
            box_loss_weight: None,
            objectness_loss_weight: None,
            classification_loss_weight: None,
        }
    }
}

/// Composite localization, objectness and classification loss over built
/// targets.
#[derive(Debug)]
pub struct YoloRotLoss {
    reduction: Reduction,
    bce: BceLoss,
    obj_scale: f64,
    noobj_scale: f64,
    box_loss_weight: f64,
    objectness_loss_weight: f64,
    classification_loss_weight: f64,
}

impl YoloRotLoss {
    pub fn forward(
        &self,
        pred_conf: &Tensor,
        pred_cls: &Tensor,
        targets: &RotTargets,
    ) -> Result<YoloRotLossOutput> {
        let RotTargets {
            obj_mask,
            noobj_mask,
            tcls,
            tconf,
            iou_scores,
            ..
        } = targets;

        let num_classes = match pred_cls.size().as_slice() {
            &[_, _, _, _, num_classes] => num_classes,
            shape => bail!("unexpected class prediction shape {:?}", shape),
        };

        // localization over the assigned slots only
        let box_loss = self.reduce(1.0 - iou_scores.masked_select(obj_mask));

        // objectness, with positives and negatives weighted separately
        let obj_loss = {
            let loss_obj = self.bce.forward(
                &pred_conf.masked_select(obj_mask),
                &tconf.masked_select(obj_mask),
            );
            let loss_noobj = self.bce.forward(
                &pred_conf.masked_select(noobj_mask),
                &tconf.masked_select(noobj_mask),
            );
            self.obj_scale * &loss_obj + self.noobj_scale * &loss_noobj
        };

        // multi-label classification over the assigned slots
        let cls_loss = {
            let cls_mask = obj_mask.unsqueeze(-1);
            let pred = pred_cls.masked_select(&cls_mask).view([-1, num_classes]);
            let target = tcls.masked_select(&cls_mask).view([-1, num_classes]);
            self.bce.forward(&pred, &target)
        };

        let total_loss = self.box_loss_weight * &box_loss
            + self.objectness_loss_weight * &obj_loss
            + self.classification_loss_weight * &cls_loss;

        Ok(YoloRotLossOutput {
            total_loss,
            box_loss,
            obj_loss,
            cls_loss,
        })
    }

    fn reduce(&self, loss: Tensor) -> Tensor {
        match self.reduction {
            Reduction::Mean => {
                if loss.numel() != 0 {
                    loss.mean(Kind::Float)
                } else {
                    Tensor::zeros(&[], (Kind::Float, loss.device())).set_requires_grad(false)
                }
            }
            Reduction::Sum => loss.sum(Kind::Float),
            _ => panic!("reduction {:?} is not supported", self.reduction),
        }
    }
}

#[derive(Debug, TensorLike)]
pub struct YoloRotLossOutput {
    pub total_loss: Tensor,
    pub box_loss: Tensor,
    pub obj_loss: Tensor,
    pub cls_loss: Tensor,
}

impl YoloRotLossOutput {
    /// Host-side scalar values for logging.
    pub fn to_metrics(&self) -> YoloRotMetrics {
        YoloRotMetrics {
            loss: f64::from(&self.total_loss),
            box_loss: f64::from(&self.box_loss),
            obj_loss: f64::from(&self.obj_loss),
            cls_loss: f64::from(&self.cls_loss),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YoloRotMetrics {
    pub loss: f64,
    pub box_loss: f64,
    pub obj_loss: f64,
    pub cls_loss: f64,
}
