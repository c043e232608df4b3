//! `mirage-gpu` is the deferred graphics command pipeline of the emulator.
//!
//! Emulation threads record drawing work into [`CommandList`]s with a [`CommandBuilder`] and
//! submit them to a bounded [`SubmissionQueue`]. A single dispatcher thread replays the lists
//! in submission order against a [`GraphicsBackend`] and signals [`DisplayFences`] as frames
//! are presented. [`GraphicsPipeline`] wires all of this together.
//!
//! Resources are named by [`Handle`]s that producers allocate up front, so recording never
//! waits for the dispatcher.
#![deny(unsafe_code)]

pub mod backend;
pub mod builder;
pub mod cmd;
pub mod config;
pub mod dispatch;
pub mod fence;
pub mod handle;
pub mod pipeline;
pub mod queue;
pub mod snapshot;
pub mod stats;
pub mod types;

pub use backend::{BackendError, BackendKind, GraphicsBackend, NullBackend, SoftBackend};
pub use builder::CommandBuilder;
pub use cmd::{ArgBuffer, ArgReader, Command, CommandList, DecodeError, Opcode};
pub use config::{ConfigError, PipelineConfig};
pub use dispatch::{CommandError, CommandExtension, DispatchError, Dispatcher, RunSummary};
pub use fence::{DisplayFences, PresentError};
pub use handle::{Handle, HandleAllocator, HandleError, HandleTable};
pub use pipeline::{GraphicsPipeline, PipelineError};
pub use queue::{PushError, SubmissionQueue};
pub use snapshot::StateSnapshot;
pub use stats::{DispatchStats, DispatchStatsSnapshot};
