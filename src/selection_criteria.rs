use std::{collections::HashMap, sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::{de::Error as SerdeError, Deserialize, Deserializer, Serialize};

use crate::{options::ServerAddress, sdam::public::ServerInfo};

/// The minimum wire version at which secondaries accept the writes certain
/// aggregation stages can produce.
const MIN_SECONDARY_WRITE_WIRE_VERSION: i32 = 13;

/// Describes which servers are suitable for a given operation.
#[derive(Clone, derive_more::Display)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the
    /// server type, max staleness, and server tags.
    #[display("ReadPreference {_0}")]
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A
    /// `server` will be considered suitable by a `predicate` if
    /// `predicate(server)` returns true.
    #[display("Custom predicate")]
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    /// A criteria that only matches the server at the given address. Used by
    /// cursor-continuation operations that must reach the exact server that
    /// created their cursor.
    pub(crate) fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }

    /// The criteria for an operation that opts into secondary writes: the
    /// caller's read preference when every known server is recent enough to
    /// accept them, primary otherwise.
    pub(crate) fn secondary_writable(
        common_wire_version: Option<i32>,
        read_pref: &ReadPreference,
    ) -> Self {
        match common_wire_version {
            Some(version) if version < MIN_SECONDARY_WRITE_WIRE_VERSION => {
                SelectionCriteria::ReadPreference(ReadPreference::Primary)
            }
            _ => SelectionCriteria::ReadPreference(read_pref.clone()),
        }
    }
}

impl<'de> Deserialize<'de> for SelectionCriteria {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(SelectionCriteria::ReadPreference(
            ReadPreference::deserialize(deserializer)?,
        ))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver should route a read operation to members of a
/// replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a
/// replica set, and `max_staleness` specifies the maximum lag behind the
/// primary that a secondary can be to remain eligible for the operation.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the primary if it's available, but fall back
    /// to the secondaries if not.
    PrimaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to a secondary if one is available, but fall back
    /// to the primary if not.
    SecondaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the node with the least network latency
    /// regardless of whether it's the primary or a secondary.
    Nearest {
        options: Option<ReadPreferenceOptions>,
    },
}

impl std::fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut mode = self.mode().to_string();
        mode[0..1].make_ascii_uppercase();
        write!(f, "{{ Mode: {}", mode)?;

        if let Some(options) = self.options() {
            if let Some(ref tag_sets) = options.tag_sets {
                write!(f, ", Tag Sets: {:?}", tag_sets)?;
            }
            if let Some(ref max_staleness) = options.max_staleness {
                write!(f, ", Max Staleness: {:?}", max_staleness)?;
            }
        }

        write!(f, " }}")
    }
}

impl<'de> Deserialize<'de> for ReadPreference {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase", deny_unknown_fields)]
        struct ReadPreferenceHelper {
            mode: String,
            #[serde(flatten)]
            options: ReadPreferenceOptions,
        }
        let helper = ReadPreferenceHelper::deserialize(deserializer)?;
        match helper.mode.to_ascii_lowercase().as_str() {
            "primary" => {
                if !helper.options.is_default() {
                    return Err(D::Error::custom(format!(
                        "cannot specify options for primary read preference, got {:?}",
                        helper.options
                    )));
                }
                Ok(ReadPreference::Primary)
            }
            "secondary" => Ok(ReadPreference::Secondary {
                options: Some(helper.options),
            }),
            "primarypreferred" => Ok(ReadPreference::PrimaryPreferred {
                options: Some(helper.options),
            }),
            "secondarypreferred" => Ok(ReadPreference::SecondaryPreferred {
                options: Some(helper.options),
            }),
            "nearest" => Ok(ReadPreference::Nearest {
                options: Some(helper.options),
            }),
            other => Err(D::Error::custom(format!(
                "Unknown read preference mode: {}",
                other
            ))),
        }
    }
}

impl Serialize for ReadPreference {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[serde_with::skip_serializing_none]
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ReadPreferenceHelper<'a> {
            mode: &'static str,
            #[serde(flatten)]
            options: Option<&'a ReadPreferenceOptions>,
        }

        let helper = ReadPreferenceHelper {
            mode: self.mode(),
            options: self.options(),
        };
        helper.serialize(serializer)
    }
}

/// Specifies read preference options for non-primary read preferences.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for
    /// operations. Each tag set will be checked in order until one or more
    /// servers is found with each tag in the set.
    #[serde(alias = "tag_sets")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a
    /// secondary can be to be considered for the given operation.
    #[serde(rename = "maxStalenessSeconds", default, with = "max_staleness_serde")]
    pub max_staleness: Option<Duration>,
}

mod max_staleness_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_i64(duration.as_secs() as i64),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let seconds: Option<i64> = Deserialize::deserialize(deserializer)?;
        Ok(seconds.map(|s| Duration::from_secs(s.max(0) as u64)))
    }
}

impl ReadPreferenceOptions {
    pub(crate) fn is_default(&self) -> bool {
        self.max_staleness.is_none()
            && self
                .tag_sets
                .as_ref()
                .map(|ts| ts.is_empty() || ts[..] == [HashMap::default()])
                .unwrap_or(true)
    }
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }
}

/// A read preference tag set used to target specific replica set members.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secondary_writable_downgrades_on_old_wire_version() {
        let read_pref = ReadPreference::Secondary { options: None };
        let criteria = SelectionCriteria::secondary_writable(Some(8), &read_pref);
        assert_eq!(
            criteria.as_read_pref(),
            Some(&ReadPreference::Primary),
            "old deployments must route secondary writes to the primary"
        );

        let criteria = SelectionCriteria::secondary_writable(Some(13), &read_pref);
        assert_eq!(criteria.as_read_pref(), Some(&read_pref));

        let criteria = SelectionCriteria::secondary_writable(None, &read_pref);
        assert_eq!(criteria.as_read_pref(), Some(&read_pref));
    }

    #[test]
    fn read_preference_serializes_with_mode() {
        let read_pref = ReadPreference::SecondaryPreferred {
            options: Some(ReadPreferenceOptions {
                max_staleness: Some(Duration::from_secs(120)),
                ..Default::default()
            }),
        };
        let doc = crate::bson::to_document(&read_pref).unwrap();
        assert_eq!(
            doc,
            crate::bson::doc! { "mode": "secondaryPreferred", "maxStalenessSeconds": 120_i64 }
        );
    }
}
