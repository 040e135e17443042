use crate::{
    sdam::{
        description::{ServerDescription, TopologyDescription, TopologyType},
        public::ServerInfo,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
};

impl TopologyDescription {
    /// The servers currently suitable for an operation with the given
    /// criteria. Servers whose type is not yet known are never suitable; for
    /// a single-server deployment the read preference is ignored.
    pub(crate) fn suitable_servers(
        &self,
        criteria: &SelectionCriteria,
    ) -> Vec<&ServerDescription> {
        let known = || {
            self.servers
                .values()
                .filter(|s| s.server_type.is_available())
        };
        match criteria {
            SelectionCriteria::Predicate(predicate) => known()
                .filter(|s| predicate(&ServerInfo::new(s)))
                .collect(),
            SelectionCriteria::ReadPreference(read_pref) => match self.topology_type {
                TopologyType::Single | TopologyType::Unknown => {
                    known().filter(|s| s.server_type.is_data_bearing()).collect()
                }
                TopologyType::Sharded => known()
                    .filter(|s| s.server_type == crate::ServerType::Router)
                    .collect(),
                TopologyType::ReplicaSet => self.suitable_replica_set_members(read_pref),
            },
        }
    }

    fn suitable_replica_set_members(
        &self,
        read_pref: &ReadPreference,
    ) -> Vec<&ServerDescription> {
        let primaries = || {
            self.servers
                .values()
                .filter(|s| s.server_type == crate::ServerType::Primary)
        };
        let secondaries = || {
            let tag_sets = read_pref.tag_sets();
            self.servers
                .values()
                .filter(|s| s.server_type == crate::ServerType::Secondary)
                .filter(move |s| s.matches_tag_sets(tag_sets))
        };

        match read_pref {
            ReadPreference::Primary => primaries().collect(),
            ReadPreference::Secondary { .. } => secondaries().collect(),
            ReadPreference::PrimaryPreferred { .. } => {
                let result: Vec<_> = primaries().collect();
                if result.is_empty() {
                    secondaries().collect()
                } else {
                    result
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let result: Vec<_> = secondaries().collect();
                if result.is_empty() {
                    primaries().collect()
                } else {
                    result
                }
            }
            ReadPreference::Nearest { .. } => self
                .servers
                .values()
                .filter(|s| s.server_type.is_data_bearing())
                .filter(|s| s.matches_tag_sets(read_pref.tag_sets()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use crate::{
        sdam::{description::TopologyDescription, test_support::server_description},
        selection_criteria::{
            ReadPreference, ReadPreferenceOptions, SelectionCriteria,
        },
        ServerType,
    };

    fn replica_set() -> TopologyDescription {
        let mut description = TopologyDescription::new([
            "a:27017".parse().unwrap(),
            "b:27017".parse().unwrap(),
            "c:27017".parse().unwrap(),
        ]);
        description.update(server_description("a:27017", ServerType::Primary, 17, Some(1800)));
        description.update(server_description("b:27017", ServerType::Secondary, 17, Some(1800)));
        let mut tagged = server_description("c:27017", ServerType::Secondary, 17, Some(1800));
        tagged.tags = Some(HashMap::from([("dc".to_string(), "east".to_string())]));
        description.update(tagged);
        description
    }

    fn addresses(
        description: &TopologyDescription,
        criteria: &SelectionCriteria,
    ) -> Vec<String> {
        let mut addresses: Vec<_> = description
            .suitable_servers(criteria)
            .into_iter()
            .map(|s| s.address.to_string())
            .collect();
        addresses.sort();
        addresses
    }

    #[test]
    fn primary_mode_selects_only_the_primary() {
        let description = replica_set();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        assert_eq!(addresses(&description, &criteria), vec!["a:27017"]);
    }

    #[test]
    fn tag_sets_filter_secondaries() {
        let description = replica_set();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: Some(ReadPreferenceOptions {
                tag_sets: Some(vec![HashMap::from([(
                    "dc".to_string(),
                    "east".to_string(),
                )])]),
                ..Default::default()
            }),
        });
        assert_eq!(addresses(&description, &criteria), vec!["c:27017"]);
    }

    #[test]
    fn secondary_preferred_falls_back_to_the_primary() {
        let mut description = TopologyDescription::new(["a:27017".parse().unwrap(), "b:27017".parse().unwrap()]);
        description.update(server_description("a:27017", ServerType::Primary, 17, Some(1800)));
        let criteria =
            SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred { options: None });
        assert_eq!(addresses(&description, &criteria), vec!["a:27017"]);
    }

    #[test]
    fn predicates_see_only_known_servers() {
        let mut description = TopologyDescription::new(["a:27017".parse().unwrap(), "b:27017".parse().unwrap()]);
        description.update(server_description("a:27017", ServerType::Primary, 17, Some(1800)));
        let criteria = SelectionCriteria::from_address("b:27017".parse().unwrap());
        assert!(addresses(&description, &criteria).is_empty());

        description.update(server_description("b:27017", ServerType::Secondary, 17, Some(1800)));
        assert_eq!(addresses(&description, &criteria), vec!["b:27017"]);
    }
}
