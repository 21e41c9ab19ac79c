//! External collaborators: tutor matcher and read-model cache.

pub mod cache;
pub mod matcher;

pub use cache::{CacheStore, InMemoryCacheStore, RedisCacheStore, STUDENT_VIEWS, student_keys};
pub use matcher::{HttpTutorMatcher, InMemoryTutorMatcher, MatchRequest, TutorMatcher};
