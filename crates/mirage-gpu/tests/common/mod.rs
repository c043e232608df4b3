//! Shared helpers for `mirage-gpu` integration tests.

#![allow(dead_code)]

use mirage_gpu::backend::CallTrace;
use mirage_gpu::types::{BufferUsage, Color, ClearBits, IndexFormat, PrimitiveMode};
use mirage_gpu::{
    CommandBuilder, Dispatcher, GraphicsBackend, GraphicsPipeline, Handle, PipelineConfig,
    SoftBackend,
};

pub const SURFACE: (u32, u32) = (64, 48);

/// Routes `tracing` output through the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn config(queue_capacity: usize) -> PipelineConfig {
    PipelineConfig {
        queue_capacity,
        surface_width: SURFACE.0,
        surface_height: SURFACE.1,
        thread_name: "mirage-gpu-test".into(),
        ..PipelineConfig::default()
    }
}

/// Starts a pipeline over a [`SoftBackend`] that logs into `trace`.
pub fn soft_pipeline(queue_capacity: usize, trace: &CallTrace) -> GraphicsPipeline {
    soft_pipeline_with(queue_capacity, trace, |_| {})
}

pub fn soft_pipeline_with(
    queue_capacity: usize,
    trace: &CallTrace,
    setup: impl FnOnce(&mut Dispatcher<dyn GraphicsBackend>) + Send + 'static,
) -> GraphicsPipeline {
    init_tracing();
    let trace = trace.clone();
    GraphicsPipeline::spawn_with(
        config(queue_capacity),
        move |config| {
            let backend: Box<dyn GraphicsBackend> = Box::new(SoftBackend::with_trace(
                config.surface_width,
                config.surface_height,
                trace,
            ));
            Ok(backend)
        },
        setup,
    )
    .expect("spawn soft pipeline")
}

/// Records a program plus a six-index element buffer and binds both, ready for
/// `draw_indexed(Triangles, 6, U16, 0)`.
pub fn record_quad_setup(b: &mut CommandBuilder) -> (Handle, Handle) {
    let program = b.create_program(b"quad.vs", b"quad.fs");
    let indices: [u16; 6] = [0, 1, 2, 2, 1, 3];
    let index_buffer = b.create_buffer(12, BufferUsage::Static, bytemuck::cast_slice(&indices));
    b.use_program(program).bind_index_buffer(index_buffer);
    (program, index_buffer)
}

pub fn record_frame(b: &mut CommandBuilder) -> u64 {
    b.clear(Color::BLACK, 1.0, 0, ClearBits::COLOR | ClearBits::DEPTH)
        .draw_indexed(PrimitiveMode::Triangles, 6, IndexFormat::U16, 0);
    b.display()
}
