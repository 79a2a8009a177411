pub mod accumulate;
pub mod codec;
pub mod decision;
pub mod embed;
pub mod error;
pub mod executor;
pub mod extract;
pub mod filter;
pub mod history;
pub mod locks;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod schema;
pub mod service;
pub mod store;
pub mod testing;

pub use decision::{DecisionProtocol, EvaluationCandidate, IntentKind, MutationIntent};
pub use embed::Embedder;
pub use error::{MemoryError, Result};
pub use executor::{AppliedMutation, ExecutionReport, NotedIntent, SkippedIntent};
pub use extract::{CandidateFact, ExtractedFacts, FactExtractor, FactMetadata};
pub use filter::{FilterValue, Filters};
pub use history::{HistoryEntry, HistoryJournal, HistoryLog};
pub use progress::{ChannelProgress, NoopProgress, ProgressEvent, ProgressSink};
pub use schema::{Clock, HistoryEvent, MemoryItem, MemoryRecord, Payload, PayloadValue, ScopeIds};
pub use service::{AddOutcome, AddRequest, MemoryService, ServiceSettings};
pub use store::{LocalVectorStore, VectorStore, open_vector_store};
#[cfg(feature = "qdrant")]
pub use store::QdrantStore;
