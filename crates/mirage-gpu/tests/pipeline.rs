mod common;

use std::sync::mpsc;
use std::time::Duration;

use mirage_gpu::backend::{gl, BackendCall, CallTrace, PixelBox};
use mirage_gpu::types::{ClearBits, Color, Rect};
use mirage_gpu::{
    ArgBuffer, BackendError, DispatchError, GraphicsBackend, GraphicsPipeline, Opcode,
    PipelineError, PresentError, PushError, SoftBackend,
};
use pretty_assertions::assert_eq;

#[test]
fn clear_draw_present_reaches_backend_in_order() {
    let trace = CallTrace::new();
    let pipeline = common::soft_pipeline(4, &trace);

    let mut b = pipeline.builder();
    common::record_quad_setup(&mut b);
    pipeline.submit(b.finish()).unwrap();
    let setup_calls = {
        let mut b = pipeline.builder();
        let fence = b.display();
        pipeline.submit(b.finish()).unwrap();
        pipeline.wait_display(fence).unwrap();
        trace.take().len()
    };
    assert_eq!(setup_calls, 5, "program, buffer, use, bind, present");

    let mut b = pipeline.builder();
    let fence = common::record_frame(&mut b);
    pipeline.submit(b.finish()).unwrap();
    pipeline.wait_display(fence).unwrap();

    assert_eq!(
        trace.take(),
        vec![
            BackendCall::Clear {
                bits: ClearBits::COLOR | ClearBits::DEPTH,
                color: Color::BLACK,
                depth: 1.0,
                stencil: 0,
            },
            BackendCall::DrawElements {
                mode: gl::TRIANGLES,
                count: 6,
                index_type: gl::UNSIGNED_SHORT,
                offset: 0,
            },
            BackendCall::Present,
        ]
    );
    assert!(pipeline.is_display_complete(fence));

    let stats = pipeline.stats();
    assert_eq!(stats.presents, 2);
    assert_eq!(stats.draw_calls, 1);
    assert_eq!(stats.commands_skipped, 0);

    let summary = pipeline.shutdown().unwrap();
    assert_eq!(summary.lists_executed, 3);
    assert_eq!(summary.lists_discarded, 0);
}

#[test]
fn lists_execute_in_submission_order() {
    let trace = CallTrace::new();
    let pipeline = common::soft_pipeline(2, &trace);

    let mut last_fence = 0;
    for i in 0..10 {
        let mut b = pipeline.builder();
        b.set_viewport(Rect::new(i, 0, 1, 1));
        if i == 9 {
            last_fence = b.display();
        }
        pipeline.submit(b.finish()).unwrap();
    }
    pipeline.wait_display(last_fence).unwrap();

    let xs: Vec<i32> = trace
        .take()
        .into_iter()
        .filter_map(|call| match call {
            BackendCall::Viewport(PixelBox { x, y, .. }) => {
                assert_eq!(y, common::SURFACE.1 as i32 - 1);
                Some(x)
            }
            _ => None,
        })
        .collect();
    assert_eq!(xs, (0..10).collect::<Vec<_>>());
}

/// Installs a display hook that reports entry and then blocks until released.
fn gated_pipeline(
    capacity: usize,
) -> (mirage_gpu::GraphicsPipeline, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let pipeline = common::soft_pipeline_with(capacity, &CallTrace::new(), move |dispatcher| {
        dispatcher.set_display_hook(move |_backend: &mut (dyn GraphicsBackend + 'static)| {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
        });
    });
    (pipeline, entered_rx, release_tx)
}

#[test]
fn abort_discards_pending_lists() {
    let (pipeline, entered, release) = gated_pipeline(8);

    let mut b = pipeline.builder();
    b.display();
    pipeline.submit(b.finish()).unwrap();
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut pending_fences = Vec::new();
    for _ in 0..3 {
        let mut b = pipeline.builder();
        b.clear(Color::WHITE, 1.0, 0, ClearBits::COLOR);
        pending_fences.push(b.display());
        pipeline.submit(b.finish()).unwrap();
    }
    assert_eq!(pipeline.pending(), 3);

    assert_eq!(pipeline.abort(), 3);
    assert_eq!(pipeline.pending(), 0);
    for fence in pending_fences {
        assert_eq!(pipeline.wait_display(fence), Err(PresentError::Aborted));
    }

    let mut b = pipeline.builder();
    b.backup_state();
    assert!(matches!(
        pipeline.submit(b.finish()),
        Err(PushError::Aborted(_))
    ));

    release.send(()).unwrap();
    let summary = pipeline.shutdown().unwrap();
    assert_eq!(summary.lists_executed, 1);
    assert_eq!(summary.lists_discarded, 3);
}

#[test]
fn full_queue_blocks_producer_until_abort() {
    let (pipeline, entered, release) = gated_pipeline(1);

    let mut b = pipeline.builder();
    b.display();
    pipeline.submit(b.finish()).unwrap();
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut b = pipeline.builder();
    b.clear(Color::BLACK, 1.0, 0, ClearBits::COLOR);
    pipeline.submit(b.finish()).unwrap();
    assert_eq!(pipeline.pending(), 1);

    std::thread::scope(|s| {
        let blocked = s.spawn(|| {
            let mut b = pipeline.builder();
            b.set_depth_mask(false).set_depth_mask(true);
            pipeline.submit(b.finish())
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished(), "push must wait for space");

        assert_eq!(pipeline.abort(), 1);
        match blocked.join().unwrap() {
            Err(PushError::Aborted(list)) => assert_eq!(list.len(), 2),
            other => panic!("expected the list back, got {other:?}"),
        }
    });

    release.send(()).unwrap();
    let summary = pipeline.shutdown().unwrap();
    assert_eq!(summary.lists_discarded, 1);
}

#[test]
fn malformed_arguments_halt_the_pipeline() {
    let pipeline = common::soft_pipeline(4, &CallTrace::new());

    let mut b = pipeline.builder();
    let mut args = ArgBuffer::new();
    args.push(7u16);
    b.push_raw(Opcode::SetViewport.raw(), args);
    let fence = b.display();
    pipeline.submit(b.finish()).unwrap();

    assert_eq!(pipeline.wait_display(fence), Err(PresentError::Aborted));
    assert!(pipeline.is_aborted());
    match pipeline.shutdown() {
        Err(PipelineError::Dispatch(DispatchError::Decode { opcode, .. })) => {
            assert_eq!(opcode, Opcode::SetViewport.raw());
        }
        other => panic!("expected a decode failure, got {other:?}"),
    }
}

#[test]
fn failed_commands_do_not_stop_the_frame() {
    let trace = CallTrace::new();
    let pipeline = common::soft_pipeline(4, &trace);

    // No program bound: the draw is skipped, clear and present still happen.
    let mut b = pipeline.builder();
    let fence = common::record_frame(&mut b);
    pipeline.submit(b.finish()).unwrap();
    pipeline.wait_display(fence).unwrap();

    let calls = trace.take();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[0], BackendCall::Clear { .. }));
    assert_eq!(calls[1], BackendCall::Present);
    assert_eq!(pipeline.stats().commands_skipped, 1);
}

#[test]
fn failed_present_is_reported_to_every_waiter() {
    common::init_tracing();
    let pipeline = GraphicsPipeline::spawn_with(
        common::config(4),
        |config| {
            let mut soft = SoftBackend::new(config.surface_width, config.surface_height);
            soft.set_present_failure(Some(BackendError::Internal("surface lost".into())));
            let backend: Box<dyn GraphicsBackend> = Box::new(soft);
            Ok(backend)
        },
        |_| {},
    )
    .unwrap();

    let mut b = pipeline.builder();
    let fence = b.display();
    pipeline.submit(b.finish()).unwrap();

    let expected = Err(PresentError::Backend(BackendError::Internal(
        "surface lost".into(),
    )));
    assert_eq!(pipeline.wait_display(fence), expected);
    assert_eq!(pipeline.wait_display(fence), expected);
    std::thread::scope(|s| {
        let other = s.spawn(|| pipeline.wait_display_timeout(fence, Duration::from_secs(5)));
        assert_eq!(other.join().unwrap(), expected);
    });
    assert!(pipeline.is_display_complete(fence));
    assert!(!pipeline.is_aborted(), "a failed present does not stop the pipeline");
    assert_eq!(pipeline.stats().commands_skipped, 1);
}

#[test]
fn dispatcher_panic_releases_waiters_and_producers() {
    let pipeline = common::soft_pipeline_with(1, &CallTrace::new(), |dispatcher| {
        dispatcher.set_display_hook(|_backend: &mut (dyn GraphicsBackend + 'static)| {
            panic!("presenter crashed");
        });
    });

    let mut b = pipeline.builder();
    let first = b.display();
    pipeline.submit(b.finish()).unwrap();
    assert_eq!(
        pipeline.wait_display_timeout(first, Duration::from_secs(5)),
        Err(PresentError::Aborted)
    );
    assert!(pipeline.is_aborted());

    // Capacity is one, so a live queue without a consumer would block here.
    for _ in 0..3 {
        let mut b = pipeline.builder();
        let fence = b.display();
        assert!(matches!(
            pipeline.submit(b.finish()),
            Err(PushError::Aborted(_))
        ));
        assert_eq!(pipeline.wait_display(fence), Err(PresentError::Aborted));
    }
    assert!(matches!(pipeline.shutdown(), Err(PipelineError::Panicked)));
}

#[test]
fn dropped_builders_do_not_strand_fence_waiters() {
    let pipeline = common::soft_pipeline(4, &CallTrace::new());
    let fence = {
        let mut b = pipeline.builder();
        b.clear(Color::BLACK, 1.0, 0, ClearBits::COLOR);
        b.display()
    };
    assert_eq!(
        pipeline.wait_display_timeout(fence, Duration::from_secs(5)),
        Err(PresentError::Discarded)
    );
    assert!(!pipeline.is_aborted());
}
