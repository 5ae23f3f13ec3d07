use std::collections::BTreeSet;
use std::sync::Arc;

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};
use ndarray::s;

use interactive_seg_rs::mocks::MockPromptableModel;
use interactive_seg_rs::{
    AnnotationSession, BoundingBox, Mask, Point, PromptEvent, SegError, SessionEvent,
    SessionState, SessionUpdate,
};

fn rect(shape: (usize, usize), rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> Mask {
    let mut mask = Mask::from_elem(shape, false);
    mask.slice_mut(s![rows, cols]).fill(true);
    mask
}

fn rgb(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 120, 30])))
}

fn loaded(
    width: u32,
    height: u32,
) -> interactive_seg_rs::Result<(AnnotationSession<MockPromptableModel>, Arc<MockPromptableModel>)> {
    let model = Arc::new(MockPromptableModel::new());
    let mut session = AnnotationSession::with_model(Arc::clone(&model));
    session.on_image_changed(&rgb(width, height))?;
    Ok((session, model))
}

fn add_point(
    session: &mut AnnotationSession<MockPromptableModel>,
    row: u32,
    col: u32,
) -> interactive_seg_rs::Result<Vec<SessionUpdate>> {
    session.on_prompt_event(PromptEvent::PointAdded {
        point: Point::positive(row, col),
    })
}

#[test]
fn cancel_from_idle_changes_nothing() -> interactive_seg_rs::Result<()> {
    let (mut session, _model) = loaded(32, 32)?;
    add_point(&mut session, 5, 5)?;
    session.confirm()?;
    let labels = session.labels();
    let version = session.label_surface().version();

    for _ in 0..3 {
        let err = session.cancel().unwrap_err();
        assert!(matches!(
            err,
            SegError::InvalidState {
                state: SessionState::Idle,
                ..
            }
        ));
        assert!(err.is_usage_error());
    }
    assert_eq!(session.labels(), labels);
    assert_eq!(session.label_surface().version(), version);
    assert!(session.prompts().is_empty());
    Ok(())
}

#[test]
fn confirm_clears_transient_state() -> interactive_seg_rs::Result<()> {
    let (mut session, _model) = loaded(40, 40)?;
    add_point(&mut session, 10, 10)?;
    session.on_prompt_event(PromptEvent::BoxCommitted {
        bbox: BoundingBox::new(20, 20, 30, 30),
    })?;
    session.on_prompt_event(PromptEvent::PointAdded {
        point: Point::negative(25, 25),
    })?;
    assert_eq!(session.state(), SessionState::Active);
    let candidate = session.candidate_mask();
    assert!(candidate.iter().any(|&v| v));

    let updates = session.confirm()?;

    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.prompts().is_empty());
    assert!(!session.has_cached_logits());
    assert!(session.candidate_mask().iter().all(|&v| !v));
    assert_eq!(session.label_surface().distinct_ids(), BTreeSet::from([1]));
    let committed = session.labels().mapv(|id| id == 1);
    assert_eq!(committed, candidate);
    assert!(updates.contains(&SessionUpdate::ButtonsEnabled {
        confirm: false,
        cancel: false
    }));
    Ok(())
}

#[test]
fn sequential_confirms_issue_increasing_ids() -> interactive_seg_rs::Result<()> {
    let (mut session, _model) = loaded(64, 16)?;

    for (n, col) in (4..64).step_by(10).enumerate() {
        add_point(&mut session, 8, col)?;
        session.confirm()?;
        let expected: BTreeSet<u32> = (1..=n as u32 + 1).collect();
        assert_eq!(session.label_surface().distinct_ids(), expected);
        assert_eq!(session.label_surface().get(8, col as usize), Some(n as u32 + 1));
    }
    Ok(())
}

#[test]
fn image_change_resets_everything() -> interactive_seg_rs::Result<()> {
    let (mut session, _model) = loaded(32, 32)?;
    add_point(&mut session, 3, 3)?;
    session.confirm()?;
    add_point(&mut session, 20, 20)?;
    assert_eq!(session.state(), SessionState::Active);

    let rgba = RgbaImage::from_pixel(48, 24, Rgba([0, 0, 0, 0]));
    session.on_image_changed(&DynamicImage::ImageRgba8(rgba))?;

    assert_eq!(session.label_surface().shape(), (24, 48));
    assert!(session.label_surface().is_blank());
    assert_eq!(session.candidate_mask().dim(), (24, 48));
    assert!(session.candidate_mask().iter().all(|&v| !v));
    assert!(session.prompts().is_empty());
    assert!(!session.has_cached_logits());
    assert_eq!(session.state(), SessionState::Idle);

    let image = session.image().cloned().expect("image is loaded");
    assert_eq!(image.get_pixel(0, 0), &Rgb([255, 255, 255]));
    Ok(())
}

#[test]
fn logits_never_cross_an_image_change() -> interactive_seg_rs::Result<()> {
    let (mut session, model) = loaded(32, 32)?;
    add_point(&mut session, 4, 4)?;
    add_point(&mut session, 6, 6)?;
    let calls = model.calls();
    assert!(calls[0].prior_logits.is_none());
    assert!(calls[1].prior_logits.is_some());

    let gray = GrayImage::from_pixel(32, 32, Luma([128]));
    session.on_image_changed(&DynamicImage::ImageLuma8(gray))?;
    add_point(&mut session, 4, 4)?;

    let last = model.last_call().expect("a prediction ran");
    assert!(last.prior_logits.is_none());
    assert_eq!(last.coords, vec![[4.0, 4.0]]);
    Ok(())
}

#[test]
fn automatic_merge_keeps_active_cycle() -> interactive_seg_rs::Result<()> {
    let (mut session, model) = loaded(30, 30)?;
    model.set_auto_masks(vec![
        rect((30, 30), 0..5, 0..5),
        rect((30, 30), 10..15, 10..15),
        rect((30, 30), 20..25, 20..25),
    ]);
    add_point(&mut session, 28, 28)?;
    session.on_prompt_event(PromptEvent::BoxCommitted {
        bbox: BoundingBox::new(26, 26, 29, 29),
    })?;
    let prompts = session.prompts().clone();
    let candidate = session.candidate_mask();

    let updates = session.handle_event(SessionEvent::AutoSegmentPressed)?;

    assert_eq!(session.label_surface().distinct_ids(), BTreeSet::from([1, 2, 3]));
    assert_eq!(session.prompts(), &prompts);
    assert_eq!(session.candidate_mask(), candidate);
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.has_cached_logits());
    assert!(matches!(
        updates.as_slice(),
        [SessionUpdate::LabelSurfaceUpdated { .. }]
    ));

    session.confirm()?;
    assert!(session.label_surface().distinct_ids().contains(&4));
    Ok(())
}

#[test]
fn automatic_failure_leaves_labels_alone() -> interactive_seg_rs::Result<()> {
    let (mut session, model) = loaded(8, 8)?;
    model.fail_predictions(true);
    let err = session.run_automatic().unwrap_err();
    assert!(matches!(err, SegError::Prediction { .. }));
    assert!(session.label_surface().is_blank());
    Ok(())
}

#[test]
fn confirm_then_cancel_scenario() -> interactive_seg_rs::Result<()> {
    let (mut session, model) = loaded(256, 256)?;
    assert_eq!(session.state(), SessionState::Idle);

    let m1 = rect((256, 256), 30..60, 210..250);
    model.push_mask(m1.clone());
    add_point(&mut session, 42, 233)?;
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.candidate_mask(), m1);

    session.confirm()?;
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.labels().mapv(|id| id == 1), m1);
    assert_eq!(session.label_surface().distinct_ids(), BTreeSet::from([1]));

    let m2 = rect((256, 256), 100..150, 200..240);
    model.push_mask(m2.clone());
    add_point(&mut session, 125, 225)?;
    assert_eq!(session.candidate_mask(), m2);
    let labels = session.labels();

    session.cancel()?;
    assert_eq!(session.labels(), labels);
    assert_eq!(session.label_surface().distinct_ids(), BTreeSet::from([1]));
    assert!(session.candidate_mask().iter().all(|&v| !v));
    assert_eq!(session.state(), SessionState::Idle);

    let calls = model.calls();
    assert_eq!(calls[0].coords, vec![[233.0, 42.0]]);
    assert_eq!(calls[0].labels, vec![1.0]);
    assert!(calls[1].prior_logits.is_none());
    Ok(())
}

#[test]
fn events_without_model_are_rejected() {
    let mut session = AnnotationSession::<MockPromptableModel>::new();
    let err = session.handle_event(SessionEvent::ImageChanged { image: rgb(4, 4) }).unwrap_err();
    assert!(matches!(err, SegError::ModelNotLoaded { .. }));
    assert_eq!(session.image_dimensions(), None);
    assert_eq!(session.label_surface().shape(), (0, 0));
}

#[test]
fn out_of_range_removal_is_rejected_without_prediction() -> interactive_seg_rs::Result<()> {
    let (mut session, model) = loaded(16, 16)?;
    add_point(&mut session, 2, 2)?;
    let err = session
        .on_prompt_event(PromptEvent::PointRemoved { index: 5 })
        .unwrap_err();
    assert!(matches!(err, SegError::Validation { .. }));
    assert_eq!(model.calls().len(), 1);
    assert_eq!(session.prompts().points().len(), 1);
    Ok(())
}
