use anyhow::Result;
use astroyolo_vision::{
    assign_labels, labels, Anchor, BoxBuffer, ConflictPolicy, DetectorConfig, GroundTruthBox,
    VisionError,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

#[test]
fn empty_ground_truth_is_all_background() -> Result<()> {
    let config = DetectorConfig::default();
    let assignment = assign_labels(&[], &config)?;

    assert_eq!(assignment.scales.len(), 3);
    for (targets, grid) in assignment.scales.iter().zip([44usize, 22, 11]) {
        assert_eq!(targets.label.shape(), &[grid, grid, 3, 7]);
        assert!(targets.label.positives().is_empty());
        assert!(targets.boxes.is_empty());
        let view = targets.label.view();
        assert!(view.slice(ndarray::s![.., .., .., 4]).iter().all(|&v| v == 0.0));
        assert!(view.slice(ndarray::s![.., .., .., 5]).iter().all(|&v| v == 1.0));
    }
    Ok(())
}

#[test]
fn box_matching_an_anchor_is_assigned_there() -> Result<()> {
    let config = DetectorConfig::default();
    // exactly anchor 0 of stride 8 (10 x 13 px) centered on cell x=2, y=3
    let gt = GroundTruthBox::new(15.0, 21.5, 25.0, 34.5, 0);
    let assignment = assign_labels(&[gt], &config)?;

    let small = assignment.scales[0].label.positives();
    assert_eq!(small.len(), 1);
    let cell = small[0];
    assert_eq!((cell.grid_y, cell.grid_x, cell.anchor), (3, 2, 0));
    assert_eq!(cell.xywh, [20.0, 28.0, 10.0, 13.0]);
    assert_eq!(cell.mix_weight, 1.0);
    assert_eq!(cell.class_id, 0);

    let raw = assignment.scales[0].label.cell(3, 2, 0);
    assert_eq!(raw[4], 1.0);
    assert!((raw[6] - 1.0).abs() < 1e-6);

    assert_eq!(assignment.positive_count(), 1);
    assert_eq!(assignment.scales[0].boxes.as_slice(), &[[20.0, 28.0, 10.0, 13.0]]);
    assert!(assignment.scales[1].boxes.is_empty());
    Ok(())
}

#[test]
fn one_box_can_claim_several_anchors() -> Result<()> {
    let config = DetectorConfig::default();
    // 12 x 20 px: IoU 0.54, 0.5 and 0.32 with the three stride 8 anchors
    let gt = GroundTruthBox::new(14.0, 18.0, 26.0, 38.0, 0);
    let assignment = assign_labels(&[gt], &config)?;

    let small = assignment.scales[0].label.positives();
    let anchors: Vec<usize> = small.iter().map(|c| c.anchor).collect();
    assert_eq!(anchors, vec![0, 1, 2]);
    assert!(small.iter().all(|c| (c.grid_y, c.grid_x) == (3, 2)));
    // one geometry per scale, not per anchor
    assert_eq!(assignment.scales[0].boxes.assigned(), 1);
    Ok(())
}

#[test]
fn tiny_box_falls_back_to_best_anchor() -> Result<()> {
    let config = DetectorConfig::default();
    // 2 x 2 px: far below the threshold on all nine anchors
    let gt = GroundTruthBox::new(3.0, 3.0, 5.0, 5.0, 0);
    let assignment = assign_labels(&[gt], &config)?;

    assert_eq!(assignment.positive_count(), 1);
    let small = assignment.scales[0].label.positives();
    assert_eq!(small.len(), 1);
    assert_eq!((small[0].grid_y, small[0].grid_x, small[0].anchor), (0, 0, 0));
    assert_eq!(assignment.scales[0].boxes.assigned(), 1);
    Ok(())
}

#[test]
fn every_box_gets_an_anchor() -> Result<()> {
    let config = DetectorConfig::default();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..200 {
        let x: f32 = rng.gen_range(0.0..340.0);
        let y: f32 = rng.gen_range(0.0..340.0);
        let w: f32 = rng.gen_range(0.5..200.5);
        let h: f32 = rng.gen_range(0.5..200.5);
        let gt = GroundTruthBox::new(x, y, x + w, y + h, 0);

        let assignment = assign_labels(&[gt], &config)?;
        assert!(
            assignment.positive_count() >= 1,
            "no anchor for {:?}",
            gt
        );
        let listed: usize = assignment.scales.iter().map(|s| s.boxes.assigned()).sum();
        assert!(listed >= 1);
    }
    Ok(())
}

#[test]
fn later_box_overwrites_shared_cell() -> Result<()> {
    let config = DetectorConfig {
        num_classes: 2,
        class_names: vec!["bhb".into(), "other".into()],
        ..Default::default()
    };
    let first = GroundTruthBox::new(15.0, 21.5, 25.0, 34.5, 0);
    let second = GroundTruthBox::new(15.0, 21.5, 25.0, 34.5, 1).with_mix_weight(0.4);

    let assignment = assign_labels(&[first, second], &config)?;
    let small = assignment.scales[0].label.positives();
    assert_eq!(small.len(), 1);
    assert_eq!(small[0].class_id, 1);
    assert!((small[0].mix_weight - 0.4).abs() < 1e-6);
    // both geometries are still recorded
    assert_eq!(assignment.scales[0].boxes.assigned(), 2);
    Ok(())
}

#[test]
fn keep_highest_iou_policy_protects_better_match() -> Result<()> {
    let config = DetectorConfig {
        num_classes: 2,
        class_names: vec![],
        conflict_policy: ConflictPolicy::KeepHighestIou,
        ..Default::default()
    };
    let exact = GroundTruthBox::new(15.0, 21.5, 25.0, 34.5, 0);
    // same cell, a bit larger: lower IoU with anchor 0
    let looser = GroundTruthBox::new(14.5, 21.0, 25.5, 35.0, 1);

    let assignment = assign_labels(&[exact, looser], &config)?;
    let small = assignment.scales[0].label.positives();
    let anchor0 = small.iter().find(|c| c.anchor == 0).unwrap();
    assert_eq!(anchor0.class_id, 0);
    assert_eq!(anchor0.xywh, [20.0, 28.0, 10.0, 13.0]);

    let last_wins = DetectorConfig {
        conflict_policy: ConflictPolicy::LastWriteWins,
        ..config
    };
    let assignment = assign_labels(&[exact, looser], &last_wins)?;
    let small = assignment.scales[0].label.positives();
    let anchor0 = small.iter().find(|c| c.anchor == 0).unwrap();
    assert_eq!(anchor0.class_id, 1);
    Ok(())
}

#[test]
fn wrapping_buffer_caps_box_list() -> Result<()> {
    let config = DetectorConfig {
        max_boxes_per_scale: 2,
        box_buffer: BoxBuffer::Wrapping,
        ..Default::default()
    };
    let boxes: Vec<GroundTruthBox> = (0..3)
        .map(|i| {
            let x = 40.0 * i as f32;
            GroundTruthBox::new(x + 15.0, 21.5, x + 25.0, 34.5, 0)
        })
        .collect();

    let assignment = assign_labels(&boxes, &config)?;
    let small = &assignment.scales[0].boxes;
    assert_eq!(small.assigned(), 3);
    assert_eq!(small.as_slice().len(), 2);
    // third box landed in slot 0
    assert_eq!(small.as_slice()[0], [100.0, 28.0, 10.0, 13.0]);
    assert_eq!(small.as_slice()[1], [60.0, 28.0, 10.0, 13.0]);
    // untouched scales keep their zeroed slots
    assert_eq!(assignment.scales[2].boxes.to_array().shape(), &[2, 4]);

    let growable = assign_labels(&boxes, &DetectorConfig::default())?;
    assert_eq!(growable.scales[0].boxes.as_slice().len(), 3);
    Ok(())
}

#[test]
fn mixup_weight_flows_into_label() -> Result<()> {
    let config = DetectorConfig::default();
    let org = [GroundTruthBox::new(15.0, 21.5, 25.0, 34.5, 0)];
    let mix = [GroundTruthBox::new(215.0, 21.5, 225.0, 34.5, 0)];
    let boxes = labels::mixup_weights(&org, &mix, 0.7);

    let (tensors, lists) = assign_labels(&boxes, &config)?.into_parts();
    assert_eq!(tensors.len(), 3);
    assert_eq!(lists[0].assigned(), 2);
    let weights: Vec<f32> = tensors[0].positives().iter().map(|c| c.mix_weight).collect();
    assert_eq!(weights.len(), 2);
    assert!((weights[0] - 0.7).abs() < 1e-6);
    assert!((weights[1] - 0.3).abs() < 1e-6);
    Ok(())
}

#[test]
fn class_out_of_range_is_rejected() {
    let config = DetectorConfig::default();
    let gt = GroundTruthBox::new(10.0, 10.0, 20.0, 20.0, 3);
    assert!(matches!(
        assign_labels(&[gt], &config),
        Err(VisionError::Annotation(_))
    ));
}

#[test]
fn annotation_line_feeds_assignment() -> Result<()> {
    let config = DetectorConfig::default();
    let ann = labels::parse_annotation_line("sdss/1237.npy 15,21.5,25,34.5,0 100,100,160,180,0")?;
    let assignment = assign_labels(&ann.boxes, &config)?;
    assert!(assignment.positive_count() >= 2);
    Ok(())
}

#[test]
fn anchor_at_exact_threshold_is_not_positive() -> Result<()> {
    let mut config = DetectorConfig {
        anchor_iou_threshold: 0.5,
        ..Default::default()
    };
    // 8 x 16 px box on cell (3, 2) is 1 x 2 cells: IoU 0.5 with a 2 x 2
    // anchor, 1.0 with a 1 x 2 anchor, 0.125 with a 4 x 4 anchor
    config.anchors.scales[0].anchors = vec![
        Anchor::new(2.0, 2.0),
        Anchor::new(1.0, 2.0),
        Anchor::new(4.0, 4.0),
    ];
    let gt = GroundTruthBox::new(16.0, 20.0, 24.0, 36.0, 0);

    let assignment = assign_labels(&[gt], &config)?;
    let small = assignment.scales[0].label.positives();
    let anchors: Vec<_> = small.iter().map(|c| (c.grid_y, c.grid_x, c.anchor)).collect();
    assert_eq!(anchors, vec![(3, 2, 1)]);
    assert_eq!(assignment.positive_count(), 1);

    config.anchor_iou_threshold = 0.49;
    let assignment = assign_labels(&[gt], &config)?;
    let anchors: Vec<_> = assignment.scales[0]
        .label
        .positives()
        .iter()
        .map(|c| c.anchor)
        .collect();
    assert_eq!(anchors, vec![0, 1]);
    Ok(())
}

#[test]
fn fallback_respects_keep_highest_iou() -> Result<()> {
    let keep = DetectorConfig {
        conflict_policy: ConflictPolicy::KeepHighestIou,
        ..Default::default()
    };
    // a lone tiny box still gets its fallback anchor
    let tiny = GroundTruthBox::new(19.0, 27.0, 21.0, 29.0, 0);
    let assignment = assign_labels(&[tiny], &keep)?;
    let small = assignment.scales[0].label.positives();
    assert_eq!(small.len(), 1);
    assert_eq!((small[0].grid_y, small[0].grid_x, small[0].anchor), (3, 2, 0));
    assert_eq!(small[0].xywh, [20.0, 28.0, 2.0, 2.0]);

    // an exact match owns cell (3, 2) anchor 0 with IoU 1; the tiny box's
    // fallback to the same anchor must not take it over
    let exact = GroundTruthBox::new(15.0, 21.5, 25.0, 34.5, 0);
    let assignment = assign_labels(&[exact, tiny], &keep)?;
    let small = assignment.scales[0].label.positives();
    assert_eq!(small.len(), 1);
    assert_eq!(small[0].xywh, [20.0, 28.0, 10.0, 13.0]);
    assert_eq!(assignment.scales[0].boxes.assigned(), 1);

    let assignment = assign_labels(&[exact, tiny], &DetectorConfig::default())?;
    let small = assignment.scales[0].label.positives();
    assert_eq!(small.len(), 1);
    assert_eq!(small[0].xywh, [20.0, 28.0, 2.0, 2.0]);
    assert_eq!(assignment.scales[0].boxes.assigned(), 2);
    Ok(())
}

#[test]
fn box_outside_the_input_gets_no_target() -> Result<()> {
    let config = DetectorConfig::default();
    let outside = GroundTruthBox::new(400.0, 400.0, 500.0, 500.0, 0);

    let assignment = assign_labels(&[outside], &config)?;
    assert_eq!(assignment.positive_count(), 0);
    assert!(assignment.scales.iter().all(|s| s.boxes.is_empty()));

    // boxes inside the input are still assigned next to it
    let inside = GroundTruthBox::new(15.0, 21.5, 25.0, 34.5, 0);
    let assignment = assign_labels(&[outside, inside], &config)?;
    let positives: Vec<_> = assignment
        .scales
        .iter()
        .flat_map(|s| s.label.positives())
        .collect();
    assert_eq!(positives.len(), 1);
    assert_eq!(positives[0].xywh, [20.0, 28.0, 10.0, 13.0]);
    Ok(())
}
