//! Traffic capture: event types, the buffered persistence/broadcast
//! pipeline, and live subscriber fan-out.

pub mod broadcaster;
pub mod pipeline;
pub mod types;

pub use broadcaster::TrafficBroadcaster;
pub use pipeline::TrafficPipeline;
pub use types::TrafficEvent;
