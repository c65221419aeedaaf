pub mod activation;
pub mod autolink;
pub mod broadcast;
pub mod cache;
pub mod classify;
pub mod consolidation;
pub mod decay;
pub mod dedup;
pub mod dream;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod graph;
pub mod intent;
pub mod keyword_index;
pub mod lesson;
pub mod pattern_miner;
pub mod preferences;
pub mod ranker;
pub mod retrieval;
pub mod schema;
pub mod shared_block;
pub mod store;
pub mod vector_store;

pub use engine::MemoryEngine;
pub use error::{MemoryError, Result};
pub use schema::{
    BroadcastEvent, BroadcastMessage, Classification, ConfidenceTag, Domain, FrustrationState,
    Lesson, LessonType, MemoryCell, MemoryType, Partition, Pattern, PatternKind, PreferenceEntry,
    Scope, SharedBlock, Urgency, UserModel,
};
pub use store::{StoreAction, StoreOutcome, StoreRequest};
pub use retrieval::{RetrievalQuery, RetrievalResult};
