//! GeoJSON reading and writing shared by deliveries, edit scripts, backbone
//! networks and model bundles.

use super::write_atomic;
use crate::error::{Error, Result};
use crate::io_err;
use crate::model::{Meta, MetaValue};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject, JsonValue};
use geo_types::Geometry;
use std::fs;
use std::path::Path;

pub fn read_feature_collection(path: &Path) -> Result<FeatureCollection> {
    let text = fs::read_to_string(path).map_err(|e| io_err!(path, e))?;
    let geojson: GeoJson = text.parse().map_err(|e| Error::format(path, e))?;
    match geojson {
        GeoJson::FeatureCollection(fc) => Ok(fc),
        GeoJson::Feature(f) => Ok(FeatureCollection {
            bbox: None,
            features: vec![f],
            foreign_members: None,
        }),
        GeoJson::Geometry(_) => Err(Error::format(path, "expected a FeatureCollection")),
    }
}

/// Parses an embedded FeatureCollection, e.g. one layer of an edit script.
pub fn feature_collection_from_value(value: JsonValue, path: &Path) -> Result<FeatureCollection> {
    match GeoJson::from_json_value(value).map_err(|e| Error::format(path, e))? {
        GeoJson::FeatureCollection(fc) => Ok(fc),
        _ => Err(Error::format(path, "expected a FeatureCollection")),
    }
}

pub fn write_feature_collection(path: &Path, features: Vec<Feature>) -> Result<()> {
    let fc = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    let text = serde_json::to_string(&GeoJson::from(fc)).map_err(|e| Error::format(path, e))?;
    write_atomic(path, text.as_bytes())
}

/// Geometry of a feature as `geo_types`; `None` for null or unsupported
/// geometries.
pub fn feature_geometry(feature: &Feature) -> Option<Geometry<f64>> {
    let geometry = feature.geometry.as_ref()?;
    Geometry::<f64>::try_from(geometry.value.clone()).ok()
}

pub fn feature(geometry: &Geometry<f64>, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::from(geometry))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Typed access to feature properties. Numbers stored as strings are
/// accepted; JSON null reads as absent.
pub struct Properties<'a> {
    map: Option<&'a JsonObject>,
}

impl<'a> Properties<'a> {
    pub fn of(feature: &'a Feature) -> Self {
        Self {
            map: feature.properties.as_ref(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&'a JsonValue> {
        self.map?.get(key).filter(|v| !v.is_null())
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            JsonValue::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|v| v.fract() == 0.0 && v.abs() < 9.0e15)
                    .map(|v| v as i64)
            }),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            JsonValue::String(s) if s.trim().is_empty() => None,
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| MetaValue::from_json(v)).and_then(|v| v.as_bool())
    }

    /// Every `meta_*` property.
    pub fn meta(&self) -> Meta {
        self.map
            .into_iter()
            .flat_map(|m| m.iter())
            .filter(|(k, _)| k.starts_with("meta_"))
            .filter_map(|(k, v)| MetaValue::from_json(v).map(|v| (k.clone(), v)))
            .collect()
    }
}

/// Inserts a meta map into GeoJSON properties.
pub fn insert_meta(properties: &mut JsonObject, meta: &Meta) {
    for (key, value) in meta {
        properties.insert(key.clone(), value.to_json());
    }
}
