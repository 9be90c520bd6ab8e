mod labels;
mod store;

pub use labels::{LabelStrategy, VocabularyLabeler, DEFAULT_SUBJECT_WORDS};
pub use store::{ContextStore, InMemoryContextStore, ThreadContext, DEFAULT_HISTORY_LIMIT};
