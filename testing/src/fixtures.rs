//! Sample marketplace events.
//!
//! Laid out under `fixtures::modules::<module>` so their type paths carry the
//! `modules` marker topic routing looks for; [`shared::Heartbeat`] has no
//! owning module.

use chrono::{DateTime, TimeZone, Utc};

/// Fixed instant for deterministic timestamps (2025-01-01 00:00:00 UTC).
#[must_use]
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Events owned by a module.
pub mod modules {
    /// Users module.
    pub mod users {
        use marketplace_events_core::event::{
            Event, EventMetadata, IntegrationEvent, IntegrationEventMetadata,
        };
        use serde::{Deserialize, Serialize};
        use uuid::Uuid;

        /// A customer or provider signed up.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct UserRegistered {
            /// Integration header
            pub metadata: IntegrationEventMetadata,
            /// New user
            pub user_id: Uuid,
            /// Contact address
            pub email: String,
        }

        impl UserRegistered {
            /// New event for `email`.
            #[must_use]
            pub fn new(email: impl Into<String>) -> Self {
                Self {
                    metadata: IntegrationEventMetadata::new("Users"),
                    user_id: Uuid::now_v7(),
                    email: email.into(),
                }
            }
        }

        impl Event for UserRegistered {
            fn metadata(&self) -> &EventMetadata {
                self.metadata.event()
            }
        }

        impl IntegrationEvent for UserRegistered {
            fn integration_metadata(&self) -> &IntegrationEventMetadata {
                &self.metadata
            }
        }
    }

    /// Jobs module.
    pub mod jobs {
        use marketplace_events_core::event::{
            DomainEvent, DomainEventMetadata, Event, EventMetadata, IntegrationEvent,
            IntegrationEventMetadata,
        };
        use serde::{Deserialize, Serialize};
        use uuid::Uuid;

        /// Domain event: a customer drafted a job.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct JobCreated {
            /// Domain header
            pub metadata: DomainEventMetadata,
            /// Job title
            pub title: String,
        }

        impl JobCreated {
            /// Version-1 event for a new job aggregate.
            #[must_use]
            pub fn new(job_id: Uuid, title: impl Into<String>) -> Self {
                Self {
                    metadata: DomainEventMetadata::new(job_id, 1),
                    title: title.into(),
                }
            }
        }

        impl Event for JobCreated {
            fn metadata(&self) -> &EventMetadata {
                self.metadata.event()
            }
        }

        impl DomainEvent for JobCreated {
            fn domain_metadata(&self) -> &DomainEventMetadata {
                &self.metadata
            }
        }

        /// Domain event: the job was cancelled.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct JobCancelled {
            /// Domain header
            pub metadata: DomainEventMetadata,
            /// Why
            pub reason: String,
        }

        impl JobCancelled {
            /// Event for `job_id` at `version`.
            #[must_use]
            pub fn new(job_id: Uuid, version: u64, reason: impl Into<String>) -> Self {
                Self {
                    metadata: DomainEventMetadata::new(job_id, version),
                    reason: reason.into(),
                }
            }
        }

        impl Event for JobCancelled {
            fn metadata(&self) -> &EventMetadata {
                self.metadata.event()
            }
        }

        impl DomainEvent for JobCancelled {
            fn domain_metadata(&self) -> &DomainEventMetadata {
                &self.metadata
            }
        }

        /// Integration event: a job is open for quotes.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct JobPosted {
            /// Integration header
            pub metadata: IntegrationEventMetadata,
            /// The job
            pub job_id: Uuid,
            /// Job title
            pub title: String,
        }

        impl JobPosted {
            /// Event for `job_id`.
            #[must_use]
            pub fn new(job_id: Uuid, title: impl Into<String>) -> Self {
                Self {
                    metadata: IntegrationEventMetadata::new("Jobs"),
                    job_id,
                    title: title.into(),
                }
            }
        }

        impl Event for JobPosted {
            fn metadata(&self) -> &EventMetadata {
                self.metadata.event()
            }
        }

        impl IntegrationEvent for JobPosted {
            fn integration_metadata(&self) -> &IntegrationEventMetadata {
                &self.metadata
            }
        }
    }
}

/// Events without an owning module.
pub mod shared {
    use marketplace_events_core::event::{
        Event, EventMetadata, IntegrationEvent, IntegrationEventMetadata,
    };
    use serde::{Deserialize, Serialize};

    /// Liveness ping.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Heartbeat {
        /// Integration header
        pub metadata: IntegrationEventMetadata,
        /// Emitting instance
        pub instance: String,
    }

    impl Heartbeat {
        /// Ping from `instance`.
        #[must_use]
        pub fn new(instance: impl Into<String>) -> Self {
            Self {
                metadata: IntegrationEventMetadata::new("Platform"),
                instance: instance.into(),
            }
        }
    }

    impl Event for Heartbeat {
        fn metadata(&self) -> &EventMetadata {
            self.metadata.event()
        }
    }

    impl IntegrationEvent for Heartbeat {
        fn integration_metadata(&self) -> &IntegrationEventMetadata {
            &self.metadata
        }
    }
}
