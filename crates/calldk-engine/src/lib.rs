pub mod adapter;
pub mod background;
pub mod codec;
pub mod config;
pub mod handoff;
pub mod optimizer;
pub mod session;

pub use adapter::{content_blocks, ToolAdapter};
pub use codec::{CodecError, ImageCodec};
pub use handoff::{DialogCommand, DialogLauncher, ExitOutcome, HandoffError};
pub use optimizer::{GeminiOptimizer, OptimizerError, TextOptimizer};
pub use session::{DialogSession, SessionError, SessionOutcome};
