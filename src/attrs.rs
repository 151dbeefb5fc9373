//! Attribute maps at the boundary between storage backends and the typed metadata.
//!
//! zarr keeps nested attributes as JSON, HDF5 stores every attribute as a JSON string. Both
//! adapters hand their attributes through [`decode_attributes`] so that the rest of the crate
//! only ever sees nested values.

use crate::annotation::CellmapAttrs;
use crate::error::{Error, Result};
use crate::ome::OmeAttrs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

pub type Attributes = Map<String, Value>;

pub const MULTISCALES: &str = "multiscales";
pub const CELLMAP: &str = "cellmap";

/// Replaces string values that hold a JSON document by the parsed document.
pub fn decode_attributes(attrs: Attributes) -> Attributes {
    attrs.into_iter().map(|(k, v)| (k, decode_value(v))).collect()
}

pub fn decode_value(value: Value) -> Value {
    match value {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
            _ => Value::String(s),
        },
        other => other,
    }
}

/// Parses every string value that is valid JSON, scalars included. Inverse of
/// [`encode_attributes`], for stores that keep each attribute as a JSON string.
pub fn decode_json_strings(attrs: Attributes) -> Attributes {
    attrs
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => {
                let parsed = serde_json::from_str::<Value>(&s).unwrap_or(Value::String(s));
                (k, parsed)
            }
            other => (k, other),
        })
        .collect()
}

/// Encodes every attribute as a JSON string, the representation used in HDF5 files.
pub fn encode_attributes(attrs: &Attributes) -> Result<Vec<(String, String)>> {
    attrs
        .iter()
        .map(|(k, v)| Ok((k.clone(), serde_json::to_string(v)?)))
        .collect()
}

fn get_typed<T: DeserializeOwned>(attrs: &Attributes, key: &str) -> Result<T> {
    let value = attrs
        .get(key)
        .ok_or_else(|| Error::MissingAttribute(key.to_string()))?;
    Ok(serde_json::from_value(decode_value(value.clone()))?)
}

fn set_typed<T: Serialize>(attrs: &mut Attributes, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)?;
    attrs.insert(key.to_string(), value);
    Ok(())
}

pub fn multiscales(attrs: &Attributes) -> Result<OmeAttrs> {
    let multiscales = get_typed(attrs, MULTISCALES)?;
    Ok(OmeAttrs { multiscales })
}

pub fn set_multiscales(attrs: &mut Attributes, doc: &OmeAttrs) -> Result<()> {
    set_typed(attrs, MULTISCALES, &doc.multiscales)
}

/// A fresh attribute map holding only `doc`.
pub fn from_multiscales(doc: &OmeAttrs) -> Result<Attributes> {
    let mut attrs = Attributes::new();
    set_multiscales(&mut attrs, doc)?;
    Ok(attrs)
}

pub fn cellmap(attrs: &Attributes) -> Result<CellmapAttrs> { get_typed(attrs, CELLMAP) }

pub fn set_cellmap(attrs: &mut Attributes, cellmap: &CellmapAttrs) -> Result<()> {
    set_typed(attrs, CELLMAP, cellmap)
}
