pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod http;
pub mod manager;
pub mod pipeline;
pub mod results;
pub mod session;
pub mod transport;

pub use capture::{BackpressurePolicy, CaptureSource, CaptureSummary, ChannelSource, WavFileSource};
pub use config::{Config, StreamSettings};
pub use error::{CaptureError, Result, StreamError, TransportError};
pub use frame::{CapturedFrame, FrameBuffer, FrameSequencer, SampleFormat, SequencedFrame};
pub use http::{create_router, AppState};
pub use manager::{SessionHandle, SessionManager};
pub use pipeline::{EnqueueOutcome, RetryPolicy, TransmissionPipeline};
pub use results::{
    ClassificationResult, MissingResult, ResultDemultiplexer, ResultOutcome, SessionEvent,
};
pub use session::{CloseReport, Session, SessionConfig, SessionState, SessionStats};
pub use transport::{LoopbackOptions, LoopbackTransport, NatsTransport, Transport};
