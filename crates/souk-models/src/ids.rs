//! Snowflake ids travel as JSON strings so browser clients never lose
//! precision. Deserialization also accepts plain numbers.

use serde::de::{self, Deserializer, Visitor};
use serde::Serializer;
use std::fmt;

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = i64;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a snowflake id as a string or integer")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
        Ok(v)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
        i64::try_from(v).map_err(|_| E::custom("id out of range"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
        v.trim()
            .parse::<i64>()
            .map_err(|_| E::custom(format!("invalid id '{v}'")))
    }
}

pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(id)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    deserializer.deserialize_any(IdVisitor)
}

/// `Option<i64>` variant, for nullable references like `last_message_id`.
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "super::deserialize")] i64);

    pub fn serialize<S: Serializer>(id: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.collect_str(id),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<i64>, D::Error> {
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(id)| id))
    }
}

/// `Vec<i64>` variant, for participant lists.
pub mod vec {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "super::deserialize")] i64);

    pub fn serialize<S: Serializer>(ids: &[i64], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(ids.len()))?;
        for id in ids {
            seq.serialize_element(&id.to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i64>, D::Error> {
        Ok(Vec::<Wrapped>::deserialize(deserializer)?
            .into_iter()
            .map(|Wrapped(id)| id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        #[serde(with = "crate::ids")]
        id: i64,
        #[serde(with = "crate::ids::option", default)]
        parent: Option<i64>,
        #[serde(with = "crate::ids::vec")]
        members: Vec<i64>,
    }

    #[test]
    fn ids_serialize_as_strings() {
        let sample = Sample {
            id: 9_007_199_254_740_993,
            parent: None,
            members: vec![1, 2],
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["id"], "9007199254740993");
        assert!(json["parent"].is_null());
        assert_eq!(json["members"], serde_json::json!(["1", "2"]));
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        let parsed: Sample =
            serde_json::from_str(r#"{"id": 42, "parent": "7", "members": ["3", 4]}"#).unwrap();
        assert_eq!(parsed.id, 42);
        assert_eq!(parsed.parent, Some(7));
        assert_eq!(parsed.members, vec![3, 4]);
    }

    #[test]
    fn garbage_id_is_rejected() {
        let err = serde_json::from_str::<Sample>(r#"{"id": "abc", "members": []}"#);
        assert!(err.is_err());
    }
}
