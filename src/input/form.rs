//! Serde deserializer over decoded form pairs.
//!
//! Keys match struct fields case-insensitively, ignoring `_` and `-`, so that
//! `MetadataFilter`, `metadata_filter` and `metadatafilter` all land on the
//! same field. Repeated keys become sequences. Keys of the form
//! `field.sub` are gathered into a map for `field`. Unknown keys are ignored.

use serde::de::{self, DeserializeSeed, IntoDeserializer, MapAccess, SeqAccess, Visitor};
use serde::forward_to_deserialize_any;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Error(pub String);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Error {}

impl de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Error(msg.to_string())
    }
}

pub fn from_pairs<T: de::DeserializeOwned>(pairs: &[(String, String)]) -> Result<T, Error> {
    T::deserialize(FormDeserializer { pairs })
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

enum Entry {
    Values(Vec<String>),
    Map(Vec<(String, Vec<String>)>),
}

/// Group pairs by target field, preserving first-appearance order.
fn group(pairs: &[(String, String)], fields: &[&'static str]) -> Vec<(String, Entry)> {
    let normalized: Vec<(String, &'static str)> =
        fields.iter().map(|f| (normalize(f), *f)).collect();
    let lookup = |key: &str| -> Option<&'static str> {
        let key = normalize(key);
        normalized.iter().find(|(n, _)| *n == key).map(|(_, f)| *f)
    };

    let mut out: Vec<(String, Entry)> = Vec::new();
    for (key, value) in pairs {
        if let Some(field) = lookup(key) {
            match out.iter_mut().find(|(k, _)| k == field) {
                Some((_, Entry::Values(values))) => values.push(value.clone()),
                Some((_, Entry::Map(_))) => {}
                None => out.push((field.to_string(), Entry::Values(vec![value.clone()]))),
            }
            continue;
        }
        let Some((prefix, sub)) = key.split_once('.') else {
            continue;
        };
        let Some(field) = lookup(prefix) else {
            continue;
        };
        let sub = sub.to_string();
        match out.iter_mut().find(|(k, _)| k == field) {
            Some((_, Entry::Map(entries))) => match entries.iter_mut().find(|(k, _)| *k == sub) {
                Some((_, values)) => values.push(value.clone()),
                None => entries.push((sub, vec![value.clone()])),
            },
            Some((_, Entry::Values(_))) => {}
            None => out.push((field.to_string(), Entry::Map(vec![(sub, vec![value.clone()])]))),
        }
    }
    out
}

struct FormDeserializer<'a> {
    pairs: &'a [(String, String)],
}

impl<'de, 'a> de::Deserializer<'de> for FormDeserializer<'a> {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_map(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        let mut grouped: Vec<(String, Entry)> = Vec::new();
        for (key, value) in self.pairs {
            match grouped.iter_mut().find(|(k, _)| k == key) {
                Some((_, Entry::Values(values))) => values.push(value.clone()),
                _ => grouped.push((key.clone(), Entry::Values(vec![value.clone()]))),
            }
        }
        visitor.visit_map(EntriesAccess::new(grouped))
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_map(EntriesAccess::new(group(self.pairs, fields)))
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct enum identifier ignored_any
    }
}

struct EntriesAccess {
    entries: std::vec::IntoIter<(String, Entry)>,
    pending: Option<Entry>,
}

impl EntriesAccess {
    fn new(entries: Vec<(String, Entry)>) -> Self {
        Self {
            entries: entries.into_iter(),
            pending: None,
        }
    }
}

impl<'de> MapAccess<'de> for EntriesAccess {
    type Error = Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>, Error> {
        match self.entries.next() {
            Some((key, entry)) => {
                self.pending = Some(entry);
                seed.deserialize(key.into_deserializer()).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, Error> {
        match self.pending.take() {
            Some(Entry::Values(values)) => seed.deserialize(ValuesDeserializer(values)),
            Some(Entry::Map(entries)) => seed.deserialize(MapDeserializer(entries)),
            None => Err(Error("value requested before key".into())),
        }
    }
}

struct MapDeserializer(Vec<(String, Vec<String>)>);

impl<'de> de::Deserializer<'de> for MapDeserializer {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        let entries = self
            .0
            .into_iter()
            .map(|(k, v)| (k, Entry::Values(v)))
            .collect();
        visitor.visit_map(EntriesAccess::new(entries))
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

struct ValuesDeserializer(Vec<String>);

impl ValuesDeserializer {
    fn first(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    fn parse<T: std::str::FromStr>(&self, kind: &str) -> Result<T, Error> {
        let raw = self.first().trim();
        raw.parse()
            .map_err(|_| Error(format!("invalid {} value {:?}", kind, raw)))
    }
}

macro_rules! parse_number {
    ($($method:ident => $visit:ident, $ty:ty;)*) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
                visitor.$visit(self.parse::<$ty>(stringify!($ty))?)
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for ValuesDeserializer {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.0.len() {
            0 => visitor.visit_unit(),
            1 => visitor.visit_string(self.first().to_string()),
            _ => self.deserialize_seq(visitor),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.first().trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "yes" => visitor.visit_bool(true),
            "false" | "0" | "off" | "no" | "" => visitor.visit_bool(false),
            other => Err(Error(format!("invalid bool value {:?}", other))),
        }
    }

    parse_number! {
        deserialize_i8 => visit_i8, i8;
        deserialize_i16 => visit_i16, i16;
        deserialize_i32 => visit_i32, i32;
        deserialize_i64 => visit_i64, i64;
        deserialize_u8 => visit_u8, u8;
        deserialize_u16 => visit_u16, u16;
        deserialize_u32 => visit_u32, u32;
        deserialize_u64 => visit_u64, u64;
        deserialize_f32 => visit_f32, f32;
        deserialize_f64 => visit_f64, f64;
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_string(self.first().to_string())
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_string(self.first().to_string())
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        if self.0.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_seq(ValuesSeq(self.0.into_iter()))
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_enum(self.first().to_string().into_deserializer())
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        i128 u128 char bytes byte_buf unit unit_struct tuple tuple_struct map
        struct identifier
    }
}

struct ValuesSeq(std::vec::IntoIter<String>);

impl<'de> SeqAccess<'de> for ValuesSeq {
    type Error = Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>, Error> {
        match self.0.next() {
            Some(value) => seed.deserialize(ValuesDeserializer(vec![value])).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    struct Rule {
        metadata_filter: String,
        enabled: bool,
        #[serde(default)]
        scale_down_ratio: f64,
        #[serde(default)]
        max_container_count: u32,
    }

    #[test]
    fn test_case_insensitive_fields_and_unknowns() {
        let rule: Rule = from_pairs(&pairs(&[
            ("metadatafilter", "pool1"),
            ("ENABLED", "true"),
            ("scale_down_ratio", "0.9"),
            ("Unknown", "x"),
        ]))
        .unwrap();
        assert_eq!(
            rule,
            Rule {
                metadata_filter: "pool1".into(),
                enabled: true,
                scale_down_ratio: 0.9,
                max_container_count: 0,
            }
        );
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Instance {
        name: String,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        parameters: BTreeMap<String, String>,
        #[serde(default)]
        plan: Option<String>,
    }

    #[test]
    fn test_repeated_keys_and_nested_maps() {
        let inst: Instance = from_pairs(&pairs(&[
            ("name", "db"),
            ("tag", "ignored"),
            ("tags", "a"),
            ("tags", "b"),
            ("parameters.size", "large"),
        ]))
        .unwrap();
        assert_eq!(inst.tags, vec!["a", "b"]);
        assert_eq!(inst.parameters.get("size").map(String::as_str), Some("large"));
        assert_eq!(inst.plan, None);
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = from_pairs::<Rule>(&pairs(&[
            ("MetadataFilter", "p"),
            ("Enabled", "true"),
            ("MaxContainerCount", "lots"),
        ]))
        .unwrap_err();
        assert!(err.0.contains("invalid u32 value"));
    }
}
