//! Results of writes guarded by uniqueness constraints.

/// The result of an idempotent insert.
///
/// A constraint conflict is not an error: the row that won is returned as
/// [`WriteOutcome::AlreadyExists`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T> {
    /// This call inserted the row.
    Created(T),

    /// An equivalent row was already there.
    AlreadyExists(T),
}

impl<T> WriteOutcome<T> {
    pub fn is_created(&self) -> bool {
        matches!(self, WriteOutcome::Created(_))
    }

    pub fn get(&self) -> &T {
        match self {
            WriteOutcome::Created(value) | WriteOutcome::AlreadyExists(value) => value,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            WriteOutcome::Created(value) | WriteOutcome::AlreadyExists(value) => value,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WriteOutcome<U> {
        match self {
            WriteOutcome::Created(value) => WriteOutcome::Created(f(value)),
            WriteOutcome::AlreadyExists(value) => WriteOutcome::AlreadyExists(f(value)),
        }
    }
}
