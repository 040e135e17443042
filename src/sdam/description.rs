use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    options::ServerAddress,
    sdam::SessionSupportStatus,
    selection_criteria::TagSet,
};

/// The minimum wire version at which servers support retryable writes.
const MIN_RETRYABLE_WRITE_WIRE_VERSION: i32 = 6;

/// The possible types for a server.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub enum ServerType {
    /// A single server not part of a replicated deployment.
    Standalone,

    /// A router in a sharded deployment.
    Router,

    /// The primary of a replica set.
    Primary,

    /// A secondary of a replica set.
    Secondary,

    /// A replica set arbiter; holds no data.
    Arbiter,

    /// A replica set member in some other, non-data-bearing configuration.
    Other,

    /// A server whose type is not yet known.
    #[serde(other)]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone | ServerType::Router | ServerType::Primary | ServerType::Secondary
        )
    }

    pub(crate) fn is_available(self) -> bool {
        self != ServerType::Unknown
    }
}

impl Default for ServerType {
    fn default() -> Self {
        ServerType::Unknown
    }
}

/// A description of the most up-to-date information known about a server.
#[derive(Clone, Debug)]
pub(crate) struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The maximum wire version the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The amount of time a session remains active on the server after its
    /// most recent use.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The replica set tags configured for the server.
    pub(crate) tags: Option<TagSet>,
}

impl ServerDescription {
    /// The placeholder description for a seed whose monitor has not reported
    /// yet.
    pub(crate) fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            max_wire_version: None,
            logical_session_timeout: None,
            tags: None,
        }
    }

    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.server_type != ServerType::Standalone
            && self.logical_session_timeout.is_some()
            && self.max_wire_version.unwrap_or(0) >= MIN_RETRYABLE_WRITE_WIRE_VERSION
    }

    fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let tags = match self.tags {
            Some(ref tags) => tags,
            None => return tag_set.is_empty(),
        };
        tag_set
            .iter()
            .all(|(key, value)| tags.get(key) == Some(value))
    }

    /// Whether this server matches any of the given tag sets. An absent or
    /// empty list matches everything.
    pub(crate) fn matches_tag_sets(&self, tag_sets: Option<&Vec<TagSet>>) -> bool {
        match tag_sets {
            None => true,
            Some(sets) if sets.is_empty() => true,
            Some(sets) => sets.iter().any(|set| self.matches_tag_set(set)),
        }
    }
}

/// The type of a deployment as a whole, derived from the types of the servers
/// reported so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TopologyType {
    Single,
    ReplicaSet,
    Sharded,
    Unknown,
}

/// A description of the deployment: everything currently known about each
/// server, plus the derived deployment-wide facts the execution pipeline
/// consults.
#[derive(Clone, Debug)]
pub(crate) struct TopologyDescription {
    pub(crate) topology_type: TopologyType,
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl TopologyDescription {
    pub(crate) fn new(seeds: impl IntoIterator<Item = ServerAddress>) -> Self {
        let servers: HashMap<_, _> = seeds
            .into_iter()
            .map(|address| (address.clone(), ServerDescription::unknown(address)))
            .collect();
        let topology_type = if servers.len() == 1 {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        };
        Self {
            topology_type,
            servers,
        }
    }

    /// Incorporates a new description for a server and re-derives the
    /// deployment type.
    pub(crate) fn update(&mut self, description: ServerDescription) {
        self.servers
            .insert(description.address.clone(), description);
        self.recompute_type();
    }

    fn recompute_type(&mut self) {
        if self.topology_type == TopologyType::Single {
            return;
        }
        let types = || self.servers.values().map(|s| s.server_type);
        self.topology_type = if types().any(|t| t == ServerType::Router) {
            TopologyType::Sharded
        } else if types().any(|t| matches!(t, ServerType::Primary | ServerType::Secondary)) {
            TopologyType::ReplicaSet
        } else {
            TopologyType::Unknown
        };
    }

    /// Whether this deployment supports sessions, derived from the known
    /// data-bearing servers: support requires every one of them to report a
    /// logical session timeout, and the effective timeout is the minimum.
    pub(crate) fn session_support_status(&self) -> SessionSupportStatus {
        let data_bearing: Vec<_> = self
            .servers
            .values()
            .filter(|s| s.server_type.is_data_bearing())
            .collect();
        if data_bearing.is_empty() {
            return SessionSupportStatus::Undetermined;
        }
        let mut timeout = Duration::MAX;
        for server in data_bearing {
            match server.logical_session_timeout {
                Some(t) => timeout = timeout.min(t),
                None => return SessionSupportStatus::Unsupported,
            }
        }
        SessionSupportStatus::Supported {
            logical_session_timeout: timeout,
        }
    }

    /// The lowest maximum wire version among known servers, if any are known.
    pub(crate) fn common_wire_version(&self) -> Option<i32> {
        self.servers
            .values()
            .filter_map(|s| s.max_wire_version)
            .min()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sdam::test_support::server_description;

    #[test]
    fn session_support_is_the_minimum_across_data_bearers() {
        let mut description = TopologyDescription::new([
            "a:27017".parse().unwrap(),
            "b:27017".parse().unwrap(),
        ]);
        assert_eq!(
            description.session_support_status(),
            SessionSupportStatus::Undetermined
        );

        description.update(server_description("a:27017", ServerType::Primary, 17, Some(1800)));
        description.update(server_description("b:27017", ServerType::Secondary, 17, Some(600)));
        assert_eq!(
            description.session_support_status(),
            SessionSupportStatus::Supported {
                logical_session_timeout: Duration::from_secs(600)
            }
        );

        description.update(server_description("b:27017", ServerType::Secondary, 17, None));
        assert_eq!(
            description.session_support_status(),
            SessionSupportStatus::Unsupported
        );
    }

    #[test]
    fn retryable_write_support_requires_sessions_and_wire_version() {
        let supported = server_description("a:27017", ServerType::Primary, 8, Some(1800));
        assert!(supported.supports_retryable_writes());

        let standalone = server_description("a:27017", ServerType::Standalone, 8, Some(1800));
        assert!(!standalone.supports_retryable_writes());

        let ancient = server_description("a:27017", ServerType::Primary, 5, Some(1800));
        assert!(!ancient.supports_retryable_writes());
    }

    #[test]
    fn common_wire_version_is_the_minimum() {
        let mut description = TopologyDescription::new([
            "a:27017".parse().unwrap(),
            "b:27017".parse().unwrap(),
        ]);
        assert_eq!(description.common_wire_version(), None);
        description.update(server_description("a:27017", ServerType::Primary, 17, Some(1800)));
        description.update(server_description("b:27017", ServerType::Secondary, 9, Some(1800)));
        assert_eq!(description.common_wire_version(), Some(9));
    }
}
