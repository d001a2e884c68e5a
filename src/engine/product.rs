//! In-memory products: bands, unit tags and the metadata tree.

use crate::engine::buffer::DataType;
use crate::types::{SarError, SarResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the abstracted metadata element operators read acquisition
/// parameters from.
pub const ABSTRACTED_METADATA: &str = "Abstracted_Metadata";

/// Physical unit tag of a band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Real,
    Imaginary,
    Amplitude,
    Intensity,
    Phase,
    Coherence,
    IntensityDb,
    Class,
    Probability,
    Dimensionless,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Real => "real",
            Unit::Imaginary => "imaginary",
            Unit::Amplitude => "amplitude",
            Unit::Intensity => "intensity",
            Unit::Phase => "phase",
            Unit::Coherence => "coherence",
            Unit::IntensityDb => "intensity_db",
            Unit::Class => "class",
            Unit::Probability => "probability",
            Unit::Dimensionless => "",
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "real" => Unit::Real,
            "imaginary" => Unit::Imaginary,
            "amplitude" => Unit::Amplitude,
            "intensity" => Unit::Intensity,
            "phase" => Unit::Phase,
            "coherence" => Unit::Coherence,
            "intensity_db" => Unit::IntensityDb,
            "class" => Unit::Class,
            "probability" => Unit::Probability,
            _ => Unit::Dimensionless,
        }
    }

    /// Whether the band is one half of an i/q pair
    pub fn is_complex_component(&self) -> bool {
        matches!(self, Unit::Real | Unit::Imaginary)
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named raster plane belonging to a product
#[derive(Debug, Clone)]
pub struct Band {
    name: String,
    unit: Unit,
    data_type: DataType,
    width: usize,
    height: usize,
    no_data_value: Option<f64>,
    raster: Option<Arc<Array2<f64>>>,
    expression: Option<String>,
}

impl Band {
    /// Declared band without data (operator targets)
    pub fn new(name: &str, unit: Unit, data_type: DataType, width: usize, height: usize) -> Self {
        Self {
            name: name.to_string(),
            unit,
            data_type,
            width,
            height,
            no_data_value: None,
            raster: None,
            expression: None,
        }
    }

    /// Band backed by an (azimuth x range) raster
    pub fn with_data(name: &str, unit: Unit, data_type: DataType, raster: Array2<f64>) -> Self {
        let (height, width) = raster.dim();
        Self {
            raster: Some(Arc::new(raster)),
            ..Self::new(name, unit, data_type, width, height)
        }
    }

    /// Derived band defined by an expression over other bands; the expression
    /// is recorded for downstream consumers and never evaluated here.
    pub fn virtual_band(name: &str, unit: Unit, expression: &str, width: usize, height: usize) -> Self {
        Self {
            expression: Some(expression.to_string()),
            ..Self::new(name, unit, DataType::Float32, width, height)
        }
    }

    pub fn with_no_data(mut self, value: f64) -> Self {
        self.no_data_value = Some(value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn no_data_value(&self) -> Option<f64> {
        self.no_data_value
    }

    pub fn raster(&self) -> Option<&Arc<Array2<f64>>> {
        self.raster.as_ref()
    }

    pub fn expression(&self) -> Option<&str> {
        self.expression.as_deref()
    }

    pub fn is_virtual(&self) -> bool {
        self.expression.is_some()
    }
}

/// Value stored in a metadata attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    Text(String),
    Float(f64),
    Int(i64),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

/// Node of the product metadata tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataElement {
    pub name: String,
    attributes: BTreeMap<String, MetadataValue>,
    elements: Vec<MetadataElement>,
}

impl MetadataElement {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<MetadataValue>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&MetadataValue> {
        self.attributes.get(key)
    }

    pub fn attribute_f64(&self, key: &str) -> Option<f64> {
        match self.attributes.get(key)? {
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Int(v) => Some(*v as f64),
            MetadataValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key)? {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Required numeric attribute
    pub fn require_f64(&self, key: &str) -> SarResult<f64> {
        self.attribute_f64(key).ok_or_else(|| {
            SarError::Metadata(format!("Attribute '{}' missing in element '{}'", key, self.name))
        })
    }

    pub fn add_element(&mut self, element: MetadataElement) {
        self.elements.push(element);
    }

    pub fn element(&self, name: &str) -> Option<&MetadataElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn element_mut(&mut self, name: &str) -> Option<&mut MetadataElement> {
        self.elements.iter_mut().find(|e| e.name == name)
    }

    pub fn elements(&self) -> &[MetadataElement] {
        &self.elements
    }
}

/// Named collection of equally sized bands plus metadata
#[derive(Debug, Clone)]
pub struct Product {
    name: String,
    width: usize,
    height: usize,
    bands: Vec<Band>,
    metadata: MetadataElement,
}

impl Product {
    pub fn new(name: &str, width: usize, height: usize) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            bands: Vec::new(),
            metadata: MetadataElement::new("metadata"),
        }
    }

    /// Empty product of the same size and metadata, named `<name>_<suffix>`
    pub fn derived(&self, suffix: &str) -> Product {
        Product {
            name: format!("{}_{}", self.name, suffix),
            width: self.width,
            height: self.height,
            bands: Vec::new(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Add a band, replacing any existing band of the same name.
    pub fn add_band(&mut self, band: Band) -> SarResult<()> {
        if band.width != self.width || band.height != self.height {
            return Err(SarError::config(
                &self.name,
                format!(
                    "Band '{}' is {}x{} but product raster size is {}x{}",
                    band.name, band.width, band.height, self.width, self.height
                ),
            ));
        }
        match self.bands.iter_mut().find(|b| b.name == band.name) {
            Some(existing) => *existing = band,
            None => self.bands.push(band),
        }
        Ok(())
    }

    /// Register a derived band expression such as intensity or phase.
    pub fn add_virtual_band(&mut self, name: &str, unit: Unit, expression: &str) -> SarResult<()> {
        self.add_band(Band::virtual_band(name, unit, expression, self.width, self.height))
    }

    pub fn band(&self, name: &str) -> Option<&Band> {
        self.bands.iter().find(|b| b.name == name)
    }

    pub fn require_band(&self, name: &str) -> SarResult<&Band> {
        self.band(name).ok_or_else(|| {
            SarError::OutOfRange(format!("Band '{}' not found in product '{}'", name, self.name))
        })
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.iter().map(|b| b.name.clone()).collect()
    }

    pub fn metadata(&self) -> &MetadataElement {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataElement {
        &mut self.metadata
    }

    pub fn abstracted_metadata(&self) -> Option<&MetadataElement> {
        self.metadata.element(ABSTRACTED_METADATA)
    }
}
