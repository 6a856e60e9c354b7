//! YAML form of a registry.
//!
//! ```yaml
//! PixelMapCollection: 1
//! Maps:
//!   DECam/N4:
//!     Type: Poly
//!     OrderX: 3
//!     OrderY: 3
//!     Parameters: [ ... ]
//!   D123456:
//!     Type: Linear
//!     Defaulted: true
//!     Parameters: [0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
//!   D123456/N4:
//!     Type: Composite
//!     Elements: [DECam/N4, D123456]
//! ```
//!
//! An atomic entry without `Parameters` starts at the identity and is
//! defaulted. Floats are written in shortest round-trip form.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Entry, TransformRegistry};
use crate::error::{FitError, Result};
use crate::transform::{MapKind, MapShape, PolyOrder};

/// Version written to, and required in, the `PixelMapCollection` key.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Document {
    pixel_map_collection: u32,
    #[serde(default)]
    maps: BTreeMap<String, MapSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct MapSpec {
    #[serde(rename = "Type")]
    kind: MapKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    order_x: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    order_y: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parameters: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    elements: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "is_false")]
    fixed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    defaulted: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl MapSpec {
    fn atomic(kind: MapKind) -> Self {
        Self {
            kind,
            order: None,
            order_x: None,
            order_y: None,
            parameters: None,
            elements: None,
            fixed: false,
            defaulted: false,
        }
    }

    fn shape(&self, name: &str) -> Result<MapShape> {
        let bad = |what: &str| FitError::Serialization(format!("map <{name}>: {what}"));
        Ok(match self.kind {
            MapKind::Identity => MapShape::Identity,
            MapKind::Constant => MapShape::Constant,
            MapKind::Linear => MapShape::Linear,
            MapKind::Poly => match (self.order, self.order_x, self.order_y) {
                (Some(n), None, None) => MapShape::Poly(PolyOrder::Total(n)),
                (None, Some(x), Some(y)) => MapShape::Poly(PolyOrder::Separate { x, y }),
                _ => return Err(bad("Poly needs either Order or both OrderX and OrderY")),
            },
            MapKind::Composite => return Err(bad("Composite is not an atomic kind")),
        })
    }
}

impl TransformRegistry {
    /// Read a YAML document into a new registry.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reg = Self::new();
        reg.read(reader)?;
        Ok(reg)
    }

    /// Learn every map of a YAML document.
    pub fn read<R: Read>(&mut self, mut reader: R) -> Result<()> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        let doc: Document = serde_yml::from_str(&text)?;
        if doc.pixel_map_collection != FORMAT_VERSION {
            return Err(FitError::Serialization(format!(
                "unsupported PixelMapCollection version {} (expected {})",
                doc.pixel_map_collection, FORMAT_VERSION
            )));
        }

        for (name, spec) in &doc.maps {
            if spec.kind == MapKind::Composite {
                let elements = spec.elements.clone().ok_or_else(|| {
                    FitError::Serialization(format!("composite <{name}> has no Elements"))
                })?;
                self.learn_composite(name, elements)?;
                continue;
            }
            let shape = spec.shape(name)?;
            match &spec.parameters {
                Some(p) => self.insert_atomic(name, shape, p, spec.fixed, spec.defaulted)?,
                None => {
                    let identity = shape.identity_params();
                    let defaulted = spec.defaulted || shape.n_params() > 0;
                    self.insert_atomic(name, shape, &identity, spec.fixed, defaulted)?
                }
            }
        }
        debug!("Read {} map specifications", doc.maps.len());
        Ok(())
    }

    /// Write every map as a YAML document.
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        let mut maps = BTreeMap::new();
        for (name, entry) in &self.entries {
            let spec = match entry {
                Entry::Composite(elements) => MapSpec {
                    elements: Some(elements.clone()),
                    ..MapSpec::atomic(MapKind::Composite)
                },
                Entry::Atomic(a) => {
                    let mut spec = MapSpec::atomic(a.shape.kind());
                    match a.shape {
                        MapShape::Poly(PolyOrder::Total(n)) => spec.order = Some(n),
                        MapShape::Poly(PolyOrder::Separate { x, y }) => {
                            spec.order_x = Some(x);
                            spec.order_y = Some(y);
                        }
                        _ => {}
                    }
                    if a.count() > 0 {
                        spec.parameters = Some(self.arena[a.offset..a.offset + a.count()].to_vec());
                    }
                    spec.fixed = a.fixed;
                    spec.defaulted = a.defaulted;
                    spec
                }
            };
            maps.insert(name.clone(), spec);
        }

        let doc = Document {
            pixel_map_collection: FORMAT_VERSION,
            maps,
        };
        writer.write_all(serde_yml::to_string(&doc)?.as_bytes())?;
        Ok(())
    }
}
