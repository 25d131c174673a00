//! Convenient re-exports for wiring a pipeline.
pub use crate::{
    backoff::{Backoff, BackoffStrategy},
    classifier::{Classifier, Outcome, RandomClassifier, ScriptedClassifier},
    config::PipelineConfig,
    envelope::Envelope,
    router::{Decision, RetryRouter},
    telemetry::{LogSink, MemorySink},
    transport::{
        AckNackAdapter, DeadLetterMode, MessageSource, OffsetCommitAdapter, RequeueAdapter,
        RequeueTopology, TransportAdapter,
    },
    worker::WorkerPool,
};
