//! Identifier types for routings and their master-data references.
//!
//! Rows owned by the engine (routings, steps, dependency edges, availability
//! records) are keyed by UUID newtypes. References into external master data
//! (parts, sites, process segments) are opaque codes resolved by collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID.
            pub fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from a UUID string.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

macro_rules! code_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a reference from its code.
            pub fn new(code: impl Into<String>) -> Self {
                Self(code.into())
            }

            /// The raw code.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(code: &str) -> Self {
                Self(code.to_string())
            }
        }

        impl From<String> for $name {
            fn from(code: String) -> Self {
                Self(code)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a routing row.
    RoutingId
);
uuid_id!(
    /// Identifier of a routing step.
    StepId
);
uuid_id!(
    /// Identifier of a step dependency edge.
    DependencyId
);
uuid_id!(
    /// Identifier of a part/site availability record.
    AvailabilityId
);

code_ref!(
    /// Reference to a part in the part master.
    PartId
);
code_ref!(
    /// Reference to a manufacturing site.
    SiteId
);
code_ref!(
    /// Reference to a process segment (standard operation) in master data.
    ProcessSegmentId
);
