//! Topic strategy selection for integration events.
//!
//! Maps an event type to the destination it is published on. The mapping is a
//! pure function of the event's type path, the configured [`TopicStrategy`],
//! and the per-type [`RoutingTable`]:
//!
//! 1. A dedicated destination registered for the type always wins.
//! 2. [`TopicStrategy::SingleWithFilters`]: everything goes to the default
//!    destination; consumers filter by message type.
//! 3. [`TopicStrategy::MultipleByDomain`]: the module segment after the
//!    `modules` marker in the type path (`app::modules::users::UserRegistered`
//!    → `users`) is looked up in the domain map; unknown domains fall back to
//!    the default.
//! 4. [`TopicStrategy::Hybrid`]: same as `MultipleByDomain`. High-volume and
//!    critical markers are consumer-side hints and never change the name.
//!
//! Selection never fails: anything unresolvable lands on the default
//! destination.

use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use thiserror::Error;

/// Namespace segment that precedes the owning module name.
pub const MODULE_MARKER: &str = "modules";

/// Default destination when none is configured.
pub const DEFAULT_DESTINATION: &str = "marketplace-events";

/// How integration events are spread over destinations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicStrategy {
    /// One shared destination; consumers filter by message type.
    #[default]
    SingleWithFilters,
    /// One destination per owning module.
    MultipleByDomain,
    /// Per-module destinations, with per-type markers reserved for consumers.
    Hybrid,
}

/// Unknown strategy name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown topic strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl FromStr for TopicStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "single" | "singlewithfilters" => Ok(Self::SingleWithFilters),
            "domain" | "multiplebydomain" => Ok(Self::MultipleByDomain),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

/// Per-type routing hints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    /// Literal destination overriding every strategy.
    pub dedicated_destination: Option<String>,
    /// Type produces a lot of traffic (consumer concurrency hint).
    pub high_volume: bool,
    /// Type is business critical (consumer priority hint).
    pub critical: bool,
}

/// Side-table of routing metadata keyed by event type path.
///
/// Populated at startup, read-only afterwards.
///
/// ```
/// use marketplace_events_core::routing::RoutingTable;
///
/// # #[derive(Debug)] struct PaymentCaptured;
/// let mut table = RoutingTable::new();
/// table.dedicated::<PaymentCaptured>("payments-critical").critical::<PaymentCaptured>();
///
/// let meta = table.get(std::any::type_name::<PaymentCaptured>()).unwrap();
/// assert_eq!(meta.dedicated_destination.as_deref(), Some("payments-critical"));
/// assert!(meta.critical);
/// ```
#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    entries: HashMap<String, RoutingMetadata>,
}

impl RoutingTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, type_path: &str) -> &mut RoutingMetadata {
        self.entries.entry(type_path.to_string()).or_default()
    }

    /// Route `E` to a dedicated destination.
    pub fn dedicated<E: ?Sized>(&mut self, destination: impl Into<String>) -> &mut Self {
        self.dedicated_path(std::any::type_name::<E>(), destination)
    }

    /// Route the type at `type_path` to a dedicated destination.
    pub fn dedicated_path(&mut self, type_path: &str, destination: impl Into<String>) -> &mut Self {
        self.entry(type_path).dedicated_destination = Some(destination.into());
        self
    }

    /// Mark `E` as high-volume.
    pub fn high_volume<E: ?Sized>(&mut self) -> &mut Self {
        self.entry(std::any::type_name::<E>()).high_volume = true;
        self
    }

    /// Mark `E` as critical.
    pub fn critical<E: ?Sized>(&mut self) -> &mut Self {
        self.entry(std::any::type_name::<E>()).critical = true;
        self
    }

    /// Metadata for a type path, if any was registered.
    #[must_use]
    pub fn get(&self, type_path: &str) -> Option<&RoutingMetadata> {
        self.entries.get(type_path)
    }
}

/// Routing configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOptions {
    /// Strategy applied to types without a dedicated destination.
    pub strategy: TopicStrategy,
    /// Fallback destination.
    pub default_destination: String,
    /// Module name → destination.
    pub domain_destinations: BTreeMap<String, String>,
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            strategy: TopicStrategy::default(),
            default_destination: DEFAULT_DESTINATION.to_string(),
            domain_destinations: BTreeMap::new(),
        }
    }
}

/// Pure event-type → destination mapping.
///
/// Immutable after construction; share it as `Arc<TopicSelector>`.
#[derive(Clone, Debug)]
pub struct TopicSelector {
    strategy: TopicStrategy,
    default_destination: String,
    domains: HashMap<String, String>,
    table: RoutingTable,
}

impl TopicSelector {
    /// Build a selector. Domain keys are matched case-insensitively.
    #[must_use]
    pub fn new(options: RoutingOptions, table: RoutingTable) -> Self {
        let domains = options
            .domain_destinations
            .into_iter()
            .map(|(domain, destination)| (domain.to_ascii_lowercase(), destination))
            .collect();

        Self {
            strategy: options.strategy,
            default_destination: options.default_destination,
            domains,
            table,
        }
    }

    /// Configured strategy.
    #[must_use]
    pub const fn strategy(&self) -> TopicStrategy {
        self.strategy
    }

    /// Fallback destination.
    #[must_use]
    pub fn default_destination(&self) -> &str {
        &self.default_destination
    }

    /// Destination for event type `E`.
    #[must_use]
    pub fn select_topic<E: ?Sized>(&self) -> &str {
        self.select_topic_by_path(std::any::type_name::<E>())
    }

    /// Destination for the runtime type of `event`.
    #[must_use]
    pub fn select_topic_for(&self, event: &dyn Event) -> &str {
        self.select_topic_by_path(event.type_path())
    }

    /// Destination for a fully qualified type path.
    #[must_use]
    pub fn select_topic_by_path(&self, type_path: &str) -> &str {
        if let Some(dedicated) = self
            .table
            .get(type_path)
            .and_then(|meta| meta.dedicated_destination.as_deref())
        {
            return dedicated;
        }

        match self.strategy {
            TopicStrategy::SingleWithFilters => &self.default_destination,
            TopicStrategy::MultipleByDomain | TopicStrategy::Hybrid => extract_domain(type_path)
                .and_then(|domain| self.domains.get(&domain.to_ascii_lowercase()))
                .map_or(self.default_destination.as_str(), String::as_str),
        }
    }

    /// Consumer-side routing hints for a type path.
    #[must_use]
    pub fn routing_metadata(&self, type_path: &str) -> RoutingMetadata {
        self.table.get(type_path).cloned().unwrap_or_default()
    }
}

impl Default for TopicSelector {
    fn default() -> Self {
        Self::new(RoutingOptions::default(), RoutingTable::new())
    }
}

/// Owning module of a type path.
///
/// Accepts Rust paths (`app::modules::users::UserRegistered`) and dotted
/// namespaces (`Marketplace.Modules.Users.Events.UserRegistered`). Returns
/// `None` when the marker is missing, appears more than once, or is followed
/// directly by the type name.
///
/// ```
/// use marketplace_events_core::routing::extract_domain;
///
/// assert_eq!(extract_domain("app::modules::users::events::UserRegistered"), Some("users"));
/// assert_eq!(extract_domain("Marketplace.Modules.Jobs.JobPosted"), Some("Jobs"));
/// assert_eq!(extract_domain("app::shared::Heartbeat"), None);
/// assert_eq!(extract_domain("app::modules::Heartbeat"), None);
/// ```
#[must_use]
pub fn extract_domain(type_path: &str) -> Option<&str> {
    let base = type_path.split('<').next().unwrap_or(type_path);
    let segments: Vec<&str> = if base.contains("::") {
        base.split("::").collect()
    } else {
        base.split('.').collect()
    };

    let mut markers = segments
        .iter()
        .enumerate()
        .filter(|(_, segment)| segment.eq_ignore_ascii_case(MODULE_MARKER));
    let (index, _) = markers.next()?;
    if markers.next().is_some() {
        return None;
    }

    // The segment after the marker must be a namespace, not the type itself.
    let domain_index = index + 1;
    if domain_index + 1 >= segments.len() {
        return None;
    }

    segments
        .get(domain_index)
        .copied()
        .filter(|domain| !domain.is_empty())
}
