//! Session lifecycle, service transport and presentation events.

pub mod controller;
pub mod events;
pub mod subscription;
pub mod transport;

pub use controller::{Scene, SessionBuilder, SessionController, SessionState};
pub use events::{EventSink, LogLevel, SessionEvent};
pub use subscription::FrameSubscription;
pub use transport::{PipelineMode, PoseStatus, RelocAndMappingResult, Transport};
