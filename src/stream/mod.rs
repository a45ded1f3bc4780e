//! Per-stream state machines, their factory, and writer capabilities.

pub mod factory;
pub mod machine;
pub mod sink;

pub use factory::{Role, StreamsFactory};
pub use machine::{StreamEvent, StreamOutput, StreamSignal, StreamStateMachine};
pub use sink::{sink_channel, SinkEvent, SinkEventReceiver, SinkEventSender, StreamSink};
