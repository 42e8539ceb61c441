use crate::{common::*, Element, Point, Polygon, RotatedBox};

/// Polygon of a box shape together with its precomputed area.
#[derive(Debug, Clone)]
pub struct ShapePolygon<T> {
    pub polygon: Polygon<T>,
    pub area: T,
}

/// Row-major IoU matrix of shape `(num_targets, num_anchors)`.
#[derive(Debug, Clone, PartialEq)]
pub struct IoUMatrix<T> {
    num_rows: usize,
    num_cols: usize,
    data: Vec<T>,
}

impl<T> IoUMatrix<T>
where
    T: Element,
{
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        debug_assert!(row < self.num_rows && col < self.num_cols);
        self.data[row * self.num_cols + col]
    }

    pub fn row(&self, row: usize) -> &[T] {
        debug_assert!(row < self.num_rows);
        &self.data[row * self.num_cols..(row + 1) * self.num_cols]
    }

    /// Stable argmax over a row. Ties resolve to the first occurring
    /// maximum.
    pub fn best_col(&self, row: usize) -> (usize, T) {
        let mut best_col = 0;
        let mut best_iou = T::neg_infinity();
        for (col, &iou) in self.row(row).iter().enumerate() {
            if iou > best_iou {
                best_col = col;
                best_iou = iou;
            }
        }
        (best_col, best_iou)
    }
}

/// Builds the polygon and area of every `(w, h, im, re)` box shape,
/// anchored at `reference` to keep all vertex coordinates positive.
pub fn shape_polygons<T>(shapes: &[[T; 4]], reference: Point<T>) -> Vec<ShapePolygon<T>>
where
    T: Element,
{
    shapes
        .iter()
        .map(|&[w, h, im, re]| {
            let polygon =
                RotatedBox::new(reference.x, reference.y, w, h, im, re).to_polygon_at(reference);
            let area = polygon.area();
            ShapePolygon { polygon, area }
        })
        .collect()
}

/// Rotated IoU of every target shape against every anchor shape.
pub fn iou_boxes_vs_anchors<T>(
    targets: &[ShapePolygon<T>],
    anchors: &[ShapePolygon<T>],
) -> IoUMatrix<T>
where
    T: Element,
{
    let data = targets
        .iter()
        .flat_map(|target| {
            anchors.iter().map(|anchor| {
                target
                    .polygon
                    .iou_with_areas(&anchor.polygon, target.area, anchor.area)
            })
        })
        .collect();

    IoUMatrix {
        num_rows: targets.len(),
        num_cols: anchors.len(),
        data,
    }
}

/// Elementwise rotated IoU between matched prediction/target pairs.
pub fn iou_pred_vs_target<T>(preds: &[RotatedBox<T>], targets: &[RotatedBox<T>]) -> Result<Vec<T>>
where
    T: Element,
{
    ensure!(
        preds.len() == targets.len(),
        "prediction and target counts differ: {} vs {}",
        preds.len(),
        targets.len()
    );

    let ious = preds
        .iter()
        .zip(targets.iter())
        .map(|(pred, target)| pred.to_polygon().iou_with(&target.to_polygon()))
        .collect();
    Ok(ious)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const REFERENCE: Point<f64> = Point { x: 100.0, y: 100.0 };

    #[test]
    fn shape_polygons_share_the_reference_center() {
        let shapes = [[2.0, 2.0, 0.0, 1.0], [4.0, 2.0, 1.0, 0.0]];
        let polygons = shape_polygons(&shapes, REFERENCE);

        assert_eq!(polygons.len(), 2);
        assert_abs_diff_eq!(polygons[0].area, 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(polygons[1].area, 8.0, epsilon = 1e-9);

        // identical shapes at the shared reference overlap exactly
        let same = shape_polygons(&[[2.0, 2.0, 0.0, 1.0]], REFERENCE);
        assert_abs_diff_eq!(
            polygons[0]
                .polygon
                .iou_with_areas(&same[0].polygon, polygons[0].area, same[0].area),
            1.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn matrix_orientation_is_targets_by_anchors() {
        let targets = shape_polygons(&[[2.0, 2.0, 0.0, 1.0]], REFERENCE);
        let anchors = shape_polygons(
            &[
                [2.0, 2.0, 0.0, 1.0],
                [4.0, 2.0, 0.0, 1.0],
                [2.0, 4.0, 0.0, 1.0],
            ],
            REFERENCE,
        );

        let matrix = iou_boxes_vs_anchors(&targets, &anchors);
        assert_eq!((matrix.num_rows(), matrix.num_cols()), (1, 3));
        assert_abs_diff_eq!(matrix.get(0, 0), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(matrix.get(0, 1), 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(matrix.get(0, 2), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn best_col_is_a_stable_argmax() {
        // anchors 0 and 2 tie at IoU 1, the first must win
        let targets = shape_polygons(&[[2.0, 2.0, 0.0, 1.0]], REFERENCE);
        let anchors = shape_polygons(
            &[
                [2.0, 2.0, 0.0, 1.0],
                [4.0, 2.0, 0.0, 1.0],
                [2.0, 2.0, 1.0, 0.0],
            ],
            REFERENCE,
        );

        let matrix = iou_boxes_vs_anchors(&targets, &anchors);
        let (best, iou) = matrix.best_col(0);
        assert_eq!(best, 0);
        assert_abs_diff_eq!(iou, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn pred_vs_target_is_elementwise() {
        let preds = vec![
            RotatedBox::new(1.5, 1.5, 1.0, 1.0, 0.0, 1.0),
            RotatedBox::new(4.0, 4.0, 2.0, 2.0, 0.0, 1.0),
        ];
        let targets = vec![
            RotatedBox::new(1.5, 1.5, 1.0, 1.0, 0.0, 1.0),
            RotatedBox::new(5.0, 4.0, 2.0, 2.0, 0.0, 1.0),
        ];

        let ious = iou_pred_vs_target(&preds, &targets).unwrap();
        assert_abs_diff_eq!(ious[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ious[1], 2.0 / 6.0, epsilon = 1e-6);

        assert!(iou_pred_vs_target(&preds, &targets[..1].to_vec()).is_err());
    }

    #[test]
    fn zero_area_shapes_produce_zero_iou() {
        let targets = shape_polygons(&[[0.0, 0.0, 0.0, 1.0]], REFERENCE);
        let anchors = shape_polygons(&[[2.0, 2.0, 0.0, 1.0]], REFERENCE);
        let matrix = iou_boxes_vs_anchors(&targets, &anchors);
        assert_abs_diff_eq!(matrix.get(0, 0), 0.0, epsilon = 1e-9);
    }
}
