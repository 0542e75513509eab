//! Identifiers for projects, tasks, and agents.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Short form used in log lines and messages.
            pub fn short(&self) -> String {
                let s = self.0.simple().to_string();
                format!("{}-{}", $prefix, &s[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.short())
            }
        }
    };
}

id_type!(
    /// Identifies a task within a project's queue.
    TaskId,
    "task"
);
id_type!(
    /// Identifies an agent in the registry.
    AgentId,
    "agent"
);
id_type!(ProjectId, "project");
