use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A struct modeling the canonical name for a collection in FerroDB.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The name of the database associated with this namespace.
    pub db: String,

    /// The name of the collection this namespace corresponds to.
    pub coll: String,
}

impl Namespace {
    /// Construct a `Namespace` from database and collection names.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(2, '.');
        match (parts.next(), parts.next()) {
            (Some(db), Some(coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(Error::invalid_argument(format!(
                "malformed namespace \"{}\"; expected <db>.<collection>",
                s
            ))),
        }
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::Namespace;

    #[test]
    fn parses_dotted_collection_names() {
        let ns: Namespace = "app.events.archive".parse().unwrap();
        assert_eq!(ns.db, "app");
        assert_eq!(ns.coll, "events.archive");
        assert_eq!(ns.to_string(), "app.events.archive");
    }

    #[test]
    fn rejects_malformed_namespaces() {
        assert!("app".parse::<Namespace>().is_err());
        assert!(".events".parse::<Namespace>().is_err());
        assert!("app.".parse::<Namespace>().is_err());
        assert!("".parse::<Namespace>().is_err());
    }
}
