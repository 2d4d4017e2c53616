//! zfs output parsing
//!
//! Parses the tabular text printed by `zfs list` and `zfs get all`. The first
//! line of both is a column header and is discarded.

use serde::Serialize;
use std::collections::BTreeMap;

/// Columns requested from `zfs list`, in the order they are parsed
pub const LIST_COLUMNS: &str = "name,avail,refer,used,mountpoint";

/// One row of `zfs list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dataset {
    pub available: String,
    #[serde(rename = "refer")]
    pub referenced: String,
    pub used: String,
    pub mountpoint: String,
}

/// Datasets keyed by full name
pub type DatasetMap = BTreeMap<String, Dataset>;

/// Value and origin of a single property
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyValue {
    pub value: String,
    pub source: String,
}

/// `name -> property -> value`
pub type AttributeMap = BTreeMap<String, BTreeMap<String, PropertyValue>>;

/// Parse `zfs list -o name,avail,refer,used,mountpoint` output.
///
/// Lines that do not split into exactly five fields are skipped.
pub fn parse_list(output: &str) -> DatasetMap {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [name, available, referenced, used, mountpoint] => Some((
                    name.to_string(),
                    Dataset {
                        available: available.to_string(),
                        referenced: referenced.to_string(),
                        used: used.to_string(),
                        mountpoint: mountpoint.to_string(),
                    },
                )),
                _ => None,
            }
        })
        .collect()
}

/// Parse `zfs get all` output (name, property, value, source).
///
/// Values containing whitespace produce more than four fields and are
/// skipped, as are blank lines.
pub fn parse_attributes(output: &str) -> AttributeMap {
    let mut attributes = AttributeMap::new();

    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let [name, property, value, source] = fields.as_slice() {
            attributes.entry(name.to_string()).or_default().insert(
                property.to_string(),
                PropertyValue {
                    value: value.to_string(),
                    source: source.to_string(),
                },
            );
        }
    }

    attributes
}
