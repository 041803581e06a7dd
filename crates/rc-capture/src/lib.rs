//! Display capture: sizing, the portal/`PipeWire` source, and the
//! coordinator that drives the primary/fallback encoder and the drain
//! loop feeding the frame buffer.

pub mod coordinator;
pub mod dimensions;
pub mod source;

pub use coordinator::{CaptureCoordinator, CaptureEvent, StreamProfile};
pub use dimensions::compute_capture_dimensions;
pub use source::{ActiveCapture, CaptureError, CaptureSource, PortalCaptureSource};
