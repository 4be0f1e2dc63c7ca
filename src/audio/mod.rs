//! Audio capture, playback, and feedback cues.
//!
//! Capture runs in a separate OS process (`hearth-capture`) so a device
//! driver fault cannot hang the control loop; the [`supervisor`] watchdog
//! owns the worker and the bounded frame queue the rest of the engine
//! consumes from.

pub mod cues;
pub mod playback;
pub mod supervisor;
pub mod worker;

pub use cues::{Cue, CuePlayer};
pub use playback::{AudioSink, PcmPlayback};
pub use supervisor::{CaptureSupervisor, ProcessLauncher, WorkerLauncher, WorkerLink};
