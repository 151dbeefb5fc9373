//! Typed view of the `cellmap` attribute of crops and label arrays.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const SEMANTIC_SEGMENTATION: &str = "semantic_segmentation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encoding {
    pub present: i64,
    pub absent: i64,
    pub unknown: i64,
}

impl Encoding {
    pub fn max_annotated(&self) -> i64 { self.present.max(self.absent) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationType {
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Cached counts of voxels that are not "present". `absent` is fractional once labels are smoothed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComplementCounts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_type: Option<AnnotationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complement_counts: Option<ComplementCounts>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CellmapAttrs {
    #[serde(default)]
    pub annotation: Annotation,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CellmapAttrs {
    pub fn class_names(&self) -> Result<&[String]> {
        self.annotation
            .class_names
            .as_deref()
            .ok_or_else(|| Error::MissingAttribute("cellmap.annotation.class_names".to_string()))
    }

    pub fn annotation_type(&self) -> Result<&AnnotationType> {
        self.annotation
            .annotation_type
            .as_ref()
            .ok_or_else(|| Error::MissingAttribute("cellmap.annotation.annotation_type".to_string()))
    }

    pub fn encoding(&self) -> Result<Encoding> {
        self.annotation_type()?
            .encoding
            .ok_or_else(|| Error::MissingAttribute("cellmap.annotation.annotation_type.encoding".to_string()))
    }

    /// Encoding of a label array that is eligible for smooth downsampling.
    pub fn semantic_encoding(&self) -> Result<Encoding> {
        let annotation_type = self.annotation_type()?;
        if annotation_type.r#type != SEMANTIC_SEGMENTATION {
            return Err(Error::NotImplemented(annotation_type.r#type.clone()));
        }
        self.encoding()
    }

    pub fn set_complement_counts(&mut self, absent: f64, unknown: u64) {
        let counts = self.annotation.complement_counts.get_or_insert_with(ComplementCounts::default);
        counts.absent = Some(absent);
        counts.unknown = Some(unknown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn label_attrs(kind: &str) -> CellmapAttrs {
        serde_json::from_value(json!({
            "annotation": {
                "annotation_type": {
                    "type": kind,
                    "encoding": {"present": 1, "absent": 0, "unknown": 255}
                },
                "complement_counts": {"absent": 10, "unknown": 3},
                "class_name": "mito"
            },
            "version": "0.1"
        }))
        .unwrap()
    }

    #[test]
    fn keeps_unmodelled_keys() {
        let attrs = label_attrs(SEMANTIC_SEGMENTATION);
        let value = serde_json::to_value(&attrs).unwrap();
        assert_eq!(value["version"], json!("0.1"));
        assert_eq!(value["annotation"]["class_name"], json!("mito"));
    }

    #[test]
    fn semantic_encoding_requires_semantic_type() {
        let attrs = label_attrs(SEMANTIC_SEGMENTATION);
        assert_eq!(attrs.semantic_encoding().unwrap().unknown, 255);
        let attrs = label_attrs("instance_segmentation");
        assert!(matches!(attrs.semantic_encoding(), Err(Error::NotImplemented(t)) if t == "instance_segmentation"));
    }

    #[test]
    fn complement_counts_are_overwritten() {
        let mut attrs = label_attrs(SEMANTIC_SEGMENTATION);
        attrs.set_complement_counts(2.5, 7);
        let counts = attrs.annotation.complement_counts.unwrap();
        assert_eq!(counts.absent, Some(2.5));
        assert_eq!(counts.unknown, Some(7));
    }
}
