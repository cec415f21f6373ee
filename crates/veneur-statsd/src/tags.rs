// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::hash::Hasher;

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ustr::Ustr;

use crate::errors::ParseError;

/// A canonicalized tag set: trimmed, de-duplicated by key (last wins), and
/// sorted by key. Two equivalent tag sets always compare equal and hash
/// identically, which is what makes the `MetricKey` digest deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SortedTags {
    values: Vec<(Ustr, Ustr)>,
}

pub const EMPTY_TAGS: SortedTags = SortedTags { values: Vec::new() };

impl SortedTags {
    /// Parses a `tag(,tag)*` section, where each tag is `key:value` or a bare
    /// `key`. Keys must be non-empty after trimming.
    pub fn parse(section: &str) -> Result<SortedTags, ParseError> {
        let mut values = Vec::new();
        for part in section.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(ParseError::MalformedTag(section.to_string()));
            }
            let (key, value) = match part.split_once(':') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (part, ""),
            };
            if key.is_empty() {
                return Err(ParseError::MalformedTag(part.to_string()));
            }
            values.push((Ustr::from(key), Ustr::from(value)));
        }
        Ok(Self::canonicalize(values))
    }

    /// Rebuilds a tag set from `key:value` strings, e.g. out of a forwarded
    /// payload. Input goes through the same canonicalization as the wire.
    pub fn from_strings(tags: &[String]) -> Result<SortedTags, ParseError> {
        if tags.is_empty() {
            return Ok(EMPTY_TAGS);
        }
        let mut values = Vec::with_capacity(tags.len());
        for tag in tags {
            let tag = tag.trim();
            let (key, value) = match tag.split_once(':') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (tag, ""),
            };
            if key.is_empty() {
                return Err(ParseError::MalformedTag(tag.to_string()));
            }
            values.push((Ustr::from(key), Ustr::from(value)));
        }
        Ok(Self::canonicalize(values))
    }

    fn canonicalize(mut values: Vec<(Ustr, Ustr)>) -> SortedTags {
        // Stable sort keeps input order within equal keys, so "last wins"
        // means keeping the final element of each run.
        values.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        let mut deduped: Vec<(Ustr, Ustr)> = Vec::with_capacity(values.len());
        for tag in values {
            match deduped.last_mut() {
                Some(last) if last.0 == tag.0 => *last = tag,
                _ => deduped.push(tag),
            }
        }
        SortedTags { values: deduped }
    }

    /// Removes the tag with the given key and returns its value, if present.
    pub fn take(&mut self, key: &str) -> Option<Ustr> {
        let idx = self.values.iter().position(|(k, _)| k.as_str() == key)?;
        Some(self.values.remove(idx).1)
    }

    pub fn get(&self, key: &str) -> Option<Ustr> {
        self.values
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| *v)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Ustr, Ustr)> {
        self.values.iter()
    }

    /// Union of `self` and `extra`; on key collision the tag in `self` wins.
    pub fn merged_with(&self, extra: &SortedTags) -> SortedTags {
        if extra.is_empty() {
            return self.clone();
        }
        let mut values = extra.values.clone();
        values.extend(self.values.iter().copied());
        Self::canonicalize(values)
    }

    /// Feeds the canonical byte form of the tag set into a hasher. Separator
    /// bytes are outside the printable range so `k:v1,k2:v2` can never
    /// collide with a differently split spelling.
    pub fn write_to_hasher<H: Hasher>(&self, hasher: &mut H) {
        for (key, value) in &self.values {
            hasher.write(key.as_bytes());
            hasher.write_u8(0x1f);
            hasher.write(value.as_bytes());
            hasher.write_u8(0x1e);
        }
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.to_string()
                } else {
                    format!("{k}:{v}")
                }
            })
            .collect()
    }
}

impl fmt::Display for SortedTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if v.is_empty() {
                write!(f, "{k}")?;
            } else {
                write!(f, "{k}:{v}")?;
            }
        }
        Ok(())
    }
}

impl Serialize for SortedTags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.values.len()))?;
        for (k, v) in &self.values {
            if v.is_empty() {
                seq.serialize_element(k.as_str())?;
            } else {
                seq.serialize_element(&format!("{k}:{v}"))?;
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for SortedTags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagsVisitor;

        impl<'de> Visitor<'de> for TagsVisitor {
            type Value = SortedTags;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sequence of key:value tag strings")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut tags = Vec::new();
                while let Some(tag) = seq.next_element::<String>()? {
                    tags.push(tag);
                }
                SortedTags::from_strings(&tags).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_seq(TagsVisitor)
    }
}
