//! Triage pipeline.
//!
//! Every notification flows through:
//! 1. `ChangeResolver`: notification → concrete message(s)
//! 2. `Classifier`: upstream payload or local heuristics
//! 3. `Organizer` and `AutoResponder`: labels, archive, canned reply
//!
//! The `DigestAggregator` runs on its own schedule over what step 3 recorded.

pub mod bus;
pub mod classifier;
pub mod digest;
pub mod organizer;
pub mod processor;
pub mod responder;
pub mod types;

pub use bus::{DeliveryReport, EventBus, EventHandler, Topic, TriageEvent};
pub use classifier::{Classifier, UpstreamClassifier};
pub use digest::{DigestAggregator, DigestSummary};
pub use processor::{PipelineDeps, TriagePipeline};
