//! OME-NGFF 0.4 multiscale metadata and the operations used to grow a pyramid level by level.
//!
//! The document is the `{"multiscales": [...]}` attribute. All operations act on the first
//! multiscale entry, which is the only one CellMap crops carry.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const AXIS_NAMES: [&str; 3] = ["z", "y", "x"];
pub const UNIT: &str = "nanometer";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmeAttrs {
    pub multiscales: Vec<OmeMultiScale>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OmeMultiScale {
    pub axes: Vec<OmeAxis>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coordinate_transformations: Vec<OmeCoordinateTransformation>,
    pub datasets: Vec<OmeDataset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmeAxis {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OmeDataset {
    pub coordinate_transformations: Vec<OmeCoordinateTransformation>,
    pub path: String,
}

/// A coordinate transformation. Types other than scale and translation are kept verbatim so
/// that they only fail when a lookup actually needs to interpret them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OmeCoordinateTransformation {
    Known(KnownTransformation),
    Other(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KnownTransformation {
    Scale { scale: Vec<f64> },
    Translation { translation: Vec<f64> },
}

impl OmeCoordinateTransformation {
    pub fn scale(scale: &[f64]) -> Self {
        OmeCoordinateTransformation::Known(KnownTransformation::Scale { scale: scale.to_vec() })
    }
    pub fn translation(translation: &[f64]) -> Self {
        OmeCoordinateTransformation::Known(KnownTransformation::Translation {
            translation: translation.to_vec(),
        })
    }
    pub fn kind(&self) -> &str {
        match self {
            OmeCoordinateTransformation::Known(KnownTransformation::Scale { .. }) => "scale",
            OmeCoordinateTransformation::Known(KnownTransformation::Translation { .. }) => "translation",
            OmeCoordinateTransformation::Other(map) => map.get("type").and_then(Value::as_str).unwrap_or("<missing>"),
        }
    }
}

impl OmeAttrs {
    pub fn from_json(json: &str) -> Result<Self> { Ok(serde_json::from_str(json)?) }

    fn first(&self) -> Result<&OmeMultiScale> {
        self.multiscales
            .first()
            .ok_or_else(|| Error::MissingAttribute("multiscales[0]".to_string()))
    }

    pub fn level(&self, name: &str) -> Result<&OmeDataset> {
        self.first()?
            .datasets
            .iter()
            .find(|ds| ds.path == name)
            .ok_or_else(|| Error::LevelNotFound(name.to_string()))
    }

    pub fn level_names(&self) -> Vec<&str> {
        self.multiscales
            .first()
            .map(|ms| ms.datasets.iter().map(|ds| ds.path.as_str()).collect())
            .unwrap_or_default()
    }
}

/// An empty pyramid over z, y, x in nanometers with an identity group-level scale.
pub fn initialize() -> OmeAttrs {
    let axes = AXIS_NAMES
        .iter()
        .map(|name| OmeAxis {
            name: name.to_string(),
            r#type: Some("space".to_string()),
            unit: Some(UNIT.to_string()),
        })
        .collect();
    OmeAttrs {
        multiscales: vec![OmeMultiScale {
            axes,
            coordinate_transformations: vec![OmeCoordinateTransformation::scale(&[1.0, 1.0, 1.0])],
            datasets: Vec::new(),
            name: None,
            version: None,
        }],
    }
}

/// Appends a level. Duplicate names are not rejected; lookups return the first match.
pub fn append_level(mut doc: OmeAttrs, name: &str, scale: &[f64], translation: &[f64]) -> OmeAttrs {
    if doc.multiscales.is_empty() {
        doc.multiscales = initialize().multiscales;
    }
    doc.multiscales[0].datasets.push(OmeDataset {
        coordinate_transformations: vec![
            OmeCoordinateTransformation::scale(scale),
            OmeCoordinateTransformation::translation(translation),
        ],
        path: name.to_string(),
    });
    doc
}

/// Reduces the document to the single level `name`, renamed to `rename`.
pub fn extract_single_level(mut doc: OmeAttrs, name: &str, rename: &str) -> Result<OmeAttrs> {
    let mut level = doc.level(name)?.clone();
    level.path = rename.to_string();
    doc.multiscales[0].datasets = vec![level];
    Ok(doc)
}

/// Scale and translation of level `name`.
pub fn resolve_transform(doc: &OmeAttrs, name: &str) -> Result<(Vec<f64>, Vec<f64>)> {
    let level = doc.level(name)?;
    let mut scale = None;
    let mut translation = None;
    for tx in &level.coordinate_transformations {
        match tx {
            OmeCoordinateTransformation::Known(KnownTransformation::Scale { scale: s }) => scale = Some(s.clone()),
            OmeCoordinateTransformation::Known(KnownTransformation::Translation { translation: t }) => {
                translation = Some(t.clone())
            }
            other => {
                return Err(Error::UnknownTransform {
                    level: name.to_string(),
                    kind: other.kind().to_string(),
                })
            }
        }
    }
    match (scale, translation) {
        (Some(scale), Some(translation)) => Ok((scale, translation)),
        _ => Err(Error::IncompleteTransform(name.to_string())),
    }
}

/// Name of the first level whose scale equals `scale` exactly.
pub fn find_level_by_scale(doc: &OmeAttrs, scale: &[f64]) -> Result<String> {
    let ms = doc.first()?;
    let scales = ms.datasets.iter().filter_map(|ds| {
        ds.coordinate_transformations.iter().find_map(|tx| match tx {
            OmeCoordinateTransformation::Known(KnownTransformation::Scale { scale }) => {
                Some((ds.path.as_str(), scale.as_slice()))
            }
            _ => None,
        })
    });
    for (path, level_scale) in scales {
        if level_scale == scale {
            return Ok(path.to_string());
        }
    }
    Err(Error::ScaleNotFound(scale.to_vec()))
}

/// Scale and translation of `level` composed with the group-level transforms of `ms`
/// (level transforms applied first).
pub fn compose_transforms(ms: &OmeMultiScale, level: &OmeDataset) -> Result<(Vec<f64>, Vec<f64>)> {
    let ndim = ms.axes.len();
    let (mut scale, mut translation) = (vec![1.0; ndim], vec![0.0; ndim]);
    let chain = level
        .coordinate_transformations
        .iter()
        .chain(ms.coordinate_transformations.iter());
    for tx in chain {
        match tx {
            OmeCoordinateTransformation::Known(KnownTransformation::Scale { scale: s }) => {
                check_len(&level.path, s, ndim)?;
                for i in 0..ndim {
                    scale[i] *= s[i];
                    translation[i] *= s[i];
                }
            }
            OmeCoordinateTransformation::Known(KnownTransformation::Translation { translation: t }) => {
                check_len(&level.path, t, ndim)?;
                for i in 0..ndim {
                    translation[i] += t[i];
                }
            }
            other => {
                return Err(Error::UnknownTransform {
                    level: level.path.clone(),
                    kind: other.kind().to_string(),
                })
            }
        }
    }
    Ok((scale, translation))
}

fn check_len(level: &str, values: &[f64], ndim: usize) -> Result<()> {
    if values.len() != ndim {
        return Err(Error::Config(format!(
            "transform for {} has {} entries but there are {} axes",
            level,
            values.len(),
            ndim
        )));
    }
    Ok(())
}

/// Derives the transform of the level one step coarser than (`scale`, `translation`).
pub fn coarser_transform(scale: &[f64], translation: &[f64], factor: usize) -> (Vec<f64>, Vec<f64>) {
    let f = factor as f64;
    let next_scale = scale.iter().map(|s| s * f).collect();
    let next_translation = scale
        .iter()
        .zip(translation)
        .map(|(s, t)| s * (f - 1.0) / 2.0 + t)
        .collect();
    (next_scale, next_translation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialize_has_zyx_and_no_levels() {
        let doc = initialize();
        let ms = &doc.multiscales[0];
        assert_eq!(ms.axes.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(), AXIS_NAMES);
        assert!(ms.axes.iter().all(|a| a.unit.as_deref() == Some(UNIT)));
        assert!(ms.datasets.is_empty());
    }

    #[test]
    fn append_then_resolve_round_trips() {
        let doc = append_level(initialize(), "s0", &[4.0, 4.0, 4.0], &[2.0, 3.0, 5.5]);
        let doc = append_level(doc, "s1", &[8.0, 8.0, 8.0], &[4.0, 5.0, 7.5]);
        assert_eq!(
            resolve_transform(&doc, "s1").unwrap(),
            (vec![8.0, 8.0, 8.0], vec![4.0, 5.0, 7.5])
        );
        assert_eq!(
            resolve_transform(&doc, "s0").unwrap(),
            (vec![4.0, 4.0, 4.0], vec![2.0, 3.0, 5.5])
        );
    }

    #[test]
    fn duplicate_levels_resolve_to_first() {
        let doc = append_level(initialize(), "s0", &[1.0, 1.0, 1.0], &[0.0, 0.0, 0.0]);
        let doc = append_level(doc, "s0", &[2.0, 2.0, 2.0], &[9.0, 9.0, 9.0]);
        assert_eq!(doc.multiscales[0].datasets.len(), 2);
        let (scale, translation) = resolve_transform(&doc, "s0").unwrap();
        assert_eq!(scale, vec![1.0, 1.0, 1.0]);
        assert_eq!(translation, vec![0.0, 0.0, 0.0]);
        assert_eq!(find_level_by_scale(&doc, &[1.0, 1.0, 1.0]).unwrap(), "s0");
    }

    #[test]
    fn missing_level_is_reported() {
        let doc = initialize();
        assert!(matches!(resolve_transform(&doc, "s3"), Err(Error::LevelNotFound(name)) if name == "s3"));
        assert!(matches!(extract_single_level(doc, "s3", "s0"), Err(Error::LevelNotFound(_))));
    }

    #[test]
    fn unknown_transform_type_fails_at_lookup() {
        let doc: OmeAttrs = serde_json::from_value(json!({
            "multiscales": [{
                "axes": [{"name": "z"}, {"name": "y"}, {"name": "x"}],
                "datasets": [{"path": "s0", "coordinateTransformations": [
                    {"type": "scale", "scale": [1.0, 1.0, 1.0]},
                    {"type": "affine", "affine": [[1.0]]}
                ]}]
            }]
        }))
        .unwrap();
        match resolve_transform(&doc, "s0") {
            Err(Error::UnknownTransform { level, kind }) => {
                assert_eq!(level, "s0");
                assert_eq!(kind, "affine");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn incomplete_transform_is_reported() {
        let doc: OmeAttrs = serde_json::from_value(json!({
            "multiscales": [{
                "axes": [{"name": "z"}, {"name": "y"}, {"name": "x"}],
                "datasets": [{"path": "s0", "coordinateTransformations": [
                    {"type": "scale", "scale": [1.0, 1.0, 1.0]}
                ]}]
            }]
        }))
        .unwrap();
        assert!(matches!(resolve_transform(&doc, "s0"), Err(Error::IncompleteTransform(_))));
    }

    #[test]
    fn extract_single_level_renames() {
        let doc = append_level(initialize(), "s0", &[4.0, 4.0, 4.0], &[0.0, 0.0, 0.0]);
        let doc = append_level(doc, "s1", &[8.0, 8.0, 8.0], &[2.0, 2.0, 2.0]);
        let single = extract_single_level(doc, "s1", "s0").unwrap();
        assert_eq!(single.level_names(), vec!["s0"]);
        assert_eq!(
            resolve_transform(&single, "s0").unwrap(),
            (vec![8.0, 8.0, 8.0], vec![2.0, 2.0, 2.0])
        );
    }

    #[test]
    fn scale_lookup_is_exact() {
        let doc = append_level(initialize(), "s0", &[4.0, 4.0, 4.0], &[0.0, 0.0, 0.0]);
        let doc = append_level(doc, "s1", &[8.0, 8.0, 8.0], &[2.0, 2.0, 2.0]);
        assert_eq!(find_level_by_scale(&doc, &[8.0, 8.0, 8.0]).unwrap(), "s1");
        assert!(matches!(
            find_level_by_scale(&doc, &[8.0, 8.0, 8.000001]),
            Err(Error::ScaleNotFound(_))
        ));
    }

    #[test]
    fn coarser_transform_adds_half_voxel() {
        let (scale, translation) = coarser_transform(&[4.0, 4.0, 4.0], &[2.0, 2.0, 2.0], 2);
        assert_eq!(scale, vec![8.0, 8.0, 8.0]);
        assert_eq!(translation, vec![4.0, 4.0, 4.0]);
    }

    #[test]
    fn serializes_with_ome_key_names() {
        let doc = append_level(initialize(), "s0", &[2.0, 2.0, 2.0], &[1.0, 1.0, 1.0]);
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            value["multiscales"][0]["datasets"][0],
            json!({
                "coordinateTransformations": [
                    {"type": "scale", "scale": [2.0, 2.0, 2.0]},
                    {"type": "translation", "translation": [1.0, 1.0, 1.0]}
                ],
                "path": "s0"
            })
        );
        assert_eq!(
            value["multiscales"][0]["coordinateTransformations"],
            json!([{"type": "scale", "scale": [1.0, 1.0, 1.0]}])
        );
    }

    #[test]
    fn group_transforms_compose_after_level_transforms() {
        let mut doc = append_level(initialize(), "s0", &[2.0, 2.0, 2.0], &[1.0, 1.0, 1.0]);
        doc.multiscales[0].coordinate_transformations = vec![
            OmeCoordinateTransformation::scale(&[3.0, 3.0, 3.0]),
            OmeCoordinateTransformation::translation(&[10.0, 0.0, 0.0]),
        ];
        let ms = &doc.multiscales[0];
        let (scale, translation) = compose_transforms(ms, &ms.datasets[0]).unwrap();
        assert_eq!(scale, vec![6.0, 6.0, 6.0]);
        assert_eq!(translation, vec![13.0, 3.0, 3.0]);
    }
}
