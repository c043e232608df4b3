//! Producer-side handle owning the dispatcher thread.

use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{create_backend, BackendError, GraphicsBackend};
use crate::builder::CommandBuilder;
use crate::cmd::CommandList;
use crate::config::{ConfigError, PipelineConfig};
use crate::dispatch::{DispatchError, Dispatcher, RunSummary};
use crate::fence::{DisplayFences, PresentError};
use crate::handle::HandleAllocator;
use crate::queue::{PushError, SubmissionQueue};
use crate::stats::{DispatchStats, DispatchStatsSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("backend initialization failed: {0}")]
    Backend(#[from] BackendError),
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("dispatcher thread panicked")]
    Panicked,
}

type DispatchThread = JoinHandle<Result<RunSummary, DispatchError>>;

/// Aborts the queue and fences if the dispatcher thread unwinds, so producers and fence waiters
/// are released instead of blocking on a consumer that no longer exists.
struct AbortOnUnwind {
    queue: Arc<SubmissionQueue>,
    fences: Arc<DisplayFences>,
}

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let dropped = self.queue.abort();
            self.fences.abort();
            tracing::error!(dropped, "dispatcher thread panicked, pipeline aborted");
        }
    }
}

/// A running command pipeline: a bounded submission queue with one dispatcher thread behind it.
///
/// Any number of threads may record with [`builder`](Self::builder) and [`submit`](Self::submit);
/// all backend work happens on the dispatcher thread, which is the only thread that ever
/// touches the backend.
#[derive(Debug)]
pub struct GraphicsPipeline {
    config: PipelineConfig,
    queue: Arc<SubmissionQueue>,
    fences: Arc<DisplayFences>,
    stats: Arc<DispatchStats>,
    handles: HandleAllocator,
    thread: Option<DispatchThread>,
}

impl GraphicsPipeline {
    /// Starts a pipeline configured from the environment.
    pub fn spawn_default() -> Result<Self, PipelineError> {
        Self::spawn(PipelineConfig::from_env()?)
    }

    pub fn spawn(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::spawn_with(
            config,
            |config| {
                Ok(create_backend(
                    config.backend,
                    config.surface_width,
                    config.surface_height,
                ))
            },
            |_| {},
        )
    }

    /// Starts a pipeline whose backend is built by `factory` on the dispatcher thread.
    ///
    /// `setup` runs on that thread before the first list is consumed; use it to install an
    /// extension or a display hook. Returns once the backend exists, so initialization errors
    /// surface here rather than on the first submit.
    pub fn spawn_with<F, S>(config: PipelineConfig, factory: F, setup: S) -> Result<Self, PipelineError>
    where
        F: FnOnce(&PipelineConfig) -> Result<Box<dyn GraphicsBackend>, BackendError> + Send + 'static,
        S: FnOnce(&mut Dispatcher<dyn GraphicsBackend>) + Send + 'static,
    {
        config.validate()?;
        let queue = Arc::new(SubmissionQueue::new(config.queue_capacity));
        let fences = Arc::new(DisplayFences::new());
        let stats = Arc::new(DispatchStats::new());

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), BackendError>>();
        let thread = {
            let config = config.clone();
            let queue = queue.clone();
            let fences = fences.clone();
            let stats = stats.clone();
            std::thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || {
                    let _abort_on_unwind = AbortOnUnwind {
                        queue: queue.clone(),
                        fences: fences.clone(),
                    };
                    let backend = match factory(&config) {
                        Ok(backend) => backend,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return Ok(RunSummary::default());
                        }
                    };
                    let mut dispatcher = Dispatcher::with_shared(backend, fences, stats);
                    setup(&mut dispatcher);
                    let _ = ready_tx.send(Ok(()));
                    drop(ready_tx);

                    let result = dispatcher.run(&queue);
                    let released = dispatcher.release_all();
                    tracing::debug!(released, "dispatcher released live resources");
                    result
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err.into());
            }
            // Sender dropped without a message: the factory or setup panicked.
            Err(_) => {
                let _ = thread.join();
                return Err(PipelineError::Panicked);
            }
        }

        tracing::info!(
            backend = %config.backend,
            queue_capacity = config.queue_capacity,
            surface = ?(config.surface_width, config.surface_height),
            "graphics pipeline started"
        );
        Ok(Self {
            config,
            queue,
            fences,
            stats,
            handles: HandleAllocator::new(),
            thread: Some(thread),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns a recorder that allocates handles and display fences from this pipeline.
    pub fn builder(&self) -> CommandBuilder {
        CommandBuilder::new(self.handles.clone(), self.fences.clone())
    }

    /// Hands `list` to the dispatcher, blocking while the queue is full.
    ///
    /// A rejected list comes back in the error; its display fences report
    /// [`PresentError::Aborted`].
    pub fn submit(&self, list: CommandList) -> Result<(), PushError> {
        self.queue.push(list).map_err(|err| {
            let PushError::Aborted(list) = &err;
            self.fences.retire_list(list, &PresentError::Aborted);
            err
        })
    }

    /// Lists waiting for the dispatcher.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn wait_display(&self, fence: u64) -> Result<(), PresentError> {
        self.fences.wait(fence)
    }

    pub fn wait_display_timeout(&self, fence: u64, timeout: Duration) -> Result<(), PresentError> {
        self.fences.wait_timeout(fence, timeout)
    }

    pub fn is_display_complete(&self, fence: u64) -> bool {
        self.fences.is_complete(fence)
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Discards every pending list and wakes blocked producers and fence waiters. The list
    /// currently executing, if any, runs to completion. Returns the number of lists dropped.
    pub fn abort(&self) -> usize {
        let dropped = self.queue.abort();
        self.fences.abort();
        tracing::info!(dropped, "graphics pipeline aborted");
        dropped
    }

    pub fn is_aborted(&self) -> bool {
        self.queue.is_aborted()
    }

    /// Aborts the pipeline and joins the dispatcher thread.
    ///
    /// Lists still pending are discarded; wait on a display fence first to flush them.
    pub fn shutdown(mut self) -> Result<RunSummary, PipelineError> {
        self.abort();
        let Some(thread) = self.thread.take() else {
            return Ok(RunSummary::default());
        };
        let summary = thread.join().map_err(|_| PipelineError::Panicked)??;
        Ok(summary)
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.queue.abort();
            self.fences.abort();
            if thread.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::types::{ClearBits, Color};

    fn null_config() -> PipelineConfig {
        PipelineConfig {
            backend: BackendKind::Null,
            surface_width: 32,
            surface_height: 32,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn display_fence_completes_after_submit() {
        let pipeline = GraphicsPipeline::spawn(null_config()).unwrap();
        let mut b = pipeline.builder();
        b.clear(Color::BLACK, 1.0, 0, ClearBits::all());
        let fence = b.display();
        pipeline.submit(b.finish()).unwrap();

        pipeline.wait_display(fence).unwrap();
        assert!(pipeline.is_display_complete(fence));
        let summary = pipeline.shutdown().unwrap();
        assert_eq!(summary.lists_executed, 1);
        assert_eq!(summary.commands_executed, 2);
    }

    #[test]
    fn backend_factory_errors_surface_at_spawn() {
        let err = GraphicsPipeline::spawn_with(
            null_config(),
            |_| Err(BackendError::Unsupported("no device")),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Backend(BackendError::Unsupported("no device"))
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PipelineConfig {
            queue_capacity: 0,
            ..null_config()
        };
        assert!(matches!(
            GraphicsPipeline::spawn(config),
            Err(PipelineError::Config(ConfigError::ZeroCapacity))
        ));
    }

    #[test]
    fn submit_after_abort_hands_the_list_back() {
        let pipeline = GraphicsPipeline::spawn(null_config()).unwrap();
        pipeline.abort();
        let mut b = pipeline.builder();
        b.backup_state();
        let err = pipeline.submit(b.finish()).unwrap_err();
        assert_eq!(err.into_list().len(), 1);
        assert!(pipeline.is_aborted());
    }
}
