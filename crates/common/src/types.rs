use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each identifier gets the same surface: random construction, conversion
/// from and into [`Uuid`], `Display`, and transparent serde.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Groups every event of one purchase lifecycle.
    ///
    /// Used as the partition key of the event log, so all events sharing a
    /// correlation id are delivered in emission order.
    CorrelationId
);

uuid_id!(
    /// Identifier of a student (the buyer of a course).
    StudentId
);

uuid_id!(
    /// Identifier of a course offered on the platform.
    CourseId
);

uuid_id!(
    /// Identifier of a tutor, as returned by the matching collaborator.
    TutorId
);

uuid_id!(
    /// Identifier of a confirmed payment owned by the payment collaborator.
    PaymentId
);

uuid_id!(
    /// Identifier of a materialized purchase.
    PurchaseId
);

uuid_id!(
    /// Identifier of a tutor allocation.
    AllocationId
);

uuid_id!(
    /// Identifier of a single scheduled session.
    SessionId
);

uuid_id!(
    /// Identifier of a dead-lettered event record.
    DeadLetterId
);
