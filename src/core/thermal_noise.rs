use crate::core::calibrate::{
    detected_inputs, line_timing, match_annotation, polarization_regex, CalibrationInfo, CalibrationType,
    DetectedInput,
};
use crate::core::lut::{parse_list, parse_utc_seconds, LutGrid, LutVector};
use crate::engine::buffer::{DataType, RasterBuffer, SampleKind};
use crate::engine::operator::{Operator, OperatorContext, OperatorState};
use crate::engine::params::ParameterMap;
use crate::engine::product::{Band, MetadataValue, Product, Unit, ABSTRACTED_METADATA};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarError, SarResult};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const THERMAL_NOISE_ID: &str = "Remove-Thermal-Noise";

/// Abstracted metadata flag telling whether noise was already removed
pub const NOISE_CORRECTED_FLAG: &str = "thermal_noise_corrected";

/// Range noise vector of a Sentinel-1 noise annotation
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseVector {
    pub azimuth_time: f64,
    pub line: i64,
    pub pixels: Vec<i64>,
    pub noise_lut: Vec<f64>,
}

/// Noise annotation of one swath/polarisation
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalNoiseInfo {
    pub polarization: String,
    pub swath: String,
    pub first_line_time: f64,
    pub last_line_time: f64,
    pub vectors: Vec<NoiseVector>,
}

impl ThermalNoiseInfo {
    /// Parse a noise annotation. Both the `noiseVectorList` layout and the
    /// newer `noiseRangeVectorList` layout are accepted; azimuth noise
    /// vectors are skipped.
    pub fn from_xml(xml_content: &str) -> SarResult<Self> {
        log::debug!("Parsing noise XML content ({} bytes)", xml_content.len());

        let mut reader = Reader::from_str(xml_content);
        reader.trim_text(true);

        let mut info = ThermalNoiseInfo {
            polarization: String::new(),
            swath: String::new(),
            first_line_time: 0.0,
            last_line_time: 0.0,
            vectors: Vec::new(),
        };
        let mut buf = Vec::new();
        let mut in_ads_header = false;
        let mut current: Option<NoiseVector> = None;
        let mut current_tag = String::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match current_tag.as_str() {
                        "adsHeader" => in_ads_header = true,
                        "noiseVector" | "noiseRangeVector" => {
                            current = Some(NoiseVector {
                                azimuth_time: 0.0,
                                line: 0,
                                pixels: Vec::new(),
                                noise_lut: Vec::new(),
                            })
                        }
                        _ => {}
                    }
                }
                Ok(Event::End(ref e)) => {
                    match e.name().as_ref() {
                        b"adsHeader" => in_ads_header = false,
                        b"noiseVector" | b"noiseRangeVector" => {
                            if let Some(vector) = current.take() {
                                info.vectors.push(vector);
                            }
                        }
                        _ => {}
                    }
                    current_tag.clear();
                }
                Ok(Event::Text(ref e)) => {
                    let text = e
                        .unescape()
                        .map_err(|e| SarError::XmlParsing(e.to_string()))?;
                    let tag = current_tag.as_str();
                    if in_ads_header {
                        match tag {
                            "polarisation" => info.polarization = text.to_string(),
                            "swath" => info.swath = text.to_string(),
                            "startTime" => info.first_line_time = parse_utc_seconds(&text)?,
                            "stopTime" => info.last_line_time = parse_utc_seconds(&text)?,
                            _ => {}
                        }
                    } else if let Some(vector) = current.as_mut() {
                        match tag {
                            "azimuthTime" => vector.azimuth_time = parse_utc_seconds(&text)?,
                            "line" => {
                                vector.line = text.trim().parse().map_err(|_| {
                                    SarError::XmlParsing(format!("Invalid line '{}'", text))
                                })?
                            }
                            "pixel" => vector.pixels = parse_list(&text, tag)?,
                            "noiseLut" | "noiseRangeLut" => vector.noise_lut = parse_list(&text, tag)?,
                            _ => {}
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(SarError::XmlParsing(format!("XML parsing error: {}", e))),
                _ => {}
            }
            buf.clear();
        }

        log::info!(
            "Parsed {} noise vectors for swath {} polarization {}",
            info.vectors.len(),
            info.swath,
            info.polarization
        );

        if info.vectors.is_empty() {
            return Err(SarError::XmlParsing("No noise vectors found in XML".to_string()));
        }
        Ok(info)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> SarResult<Self> {
        let xml = std::fs::read_to_string(path.as_ref())?;
        Self::from_xml(&xml)
    }

    pub fn line_time_interval(&self, num_lines: usize) -> Option<f64> {
        if num_lines < 2 || self.last_line_time <= self.first_line_time {
            return None;
        }
        Some((self.last_line_time - self.first_line_time) / (num_lines - 1) as f64)
    }

    pub fn lut(&self, line_time_interval: f64) -> SarResult<LutGrid> {
        let vectors = self
            .vectors
            .iter()
            .map(|v| LutVector {
                azimuth_time: v.azimuth_time,
                line: v.line,
                pixels: v.pixels.clone(),
                values: v.noise_lut.clone(),
            })
            .collect();
        LutGrid::new(self.first_line_time, line_time_interval, vectors)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalNoiseParams {
    pub remove: bool,
    /// Add the noise back to a product it was removed from
    pub reintroduce: bool,
    pub noise_files: Vec<PathBuf>,
    /// Needed only when the source bands are already calibrated
    pub calibration_files: Vec<PathBuf>,
}

impl Default for ThermalNoiseParams {
    fn default() -> Self {
        Self {
            remove: true,
            reintroduce: false,
            noise_files: Vec::new(),
            calibration_files: Vec::new(),
        }
    }
}

impl ThermalNoiseParams {
    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        let paths = |key: &str| -> Vec<PathBuf> {
            params.get_list(key).into_iter().map(PathBuf::from).collect()
        };
        Ok(Self {
            remove: params.get_bool(THERMAL_NOISE_ID, "removeThermalNoise", true)?,
            reintroduce: params.get_bool(THERMAL_NOISE_ID, "reIntroduceThermalNoise", false)?,
            noise_files: paths("noiseFiles"),
            calibration_files: paths("calibrationFiles"),
        })
    }

    pub fn validate(&self) -> SarResult<()> {
        match (self.remove, self.reintroduce) {
            (true, true) => Err(SarError::config(
                THERMAL_NOISE_ID,
                "removeThermalNoise and reIntroduceThermalNoise are mutually exclusive",
            )),
            (false, false) => Err(SarError::config(
                THERMAL_NOISE_ID,
                "one of removeThermalNoise or reIntroduceThermalNoise must be set",
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct NoiseTarget {
    band: String,
    input: DetectedInput,
    noise: LutGrid,
    /// Calibration of an already calibrated input, applied to the noise
    calibration: Option<LutGrid>,
    no_data: Option<f64>,
}

impl NoiseTarget {
    fn noise_row(&self, y: i64, x0: i64, width: usize) -> Vec<f64> {
        let noise = self.noise.row(y, x0, width);
        match &self.calibration {
            None => noise,
            Some(cal) => noise
                .into_iter()
                .zip(cal.row(y, x0, width))
                .map(|(n, a)| if a > 0.0 { n / (a * a) } else { 0.0 })
                .collect(),
        }
    }
}

/// Subtracts (or re-adds) the annotated thermal noise from |DN|^2
#[derive(Debug)]
pub struct ThermalNoiseOp {
    ctx: OperatorContext,
    params: ThermalNoiseParams,
    noise: Vec<ThermalNoiseInfo>,
    calibration: Vec<CalibrationInfo>,
    targets: Vec<NoiseTarget>,
}

impl ThermalNoiseOp {
    pub fn new() -> Self {
        Self::with_params(ThermalNoiseParams::default())
    }

    pub fn with_params(params: ThermalNoiseParams) -> Self {
        Self {
            ctx: OperatorContext::new(THERMAL_NOISE_ID),
            params,
            noise: Vec::new(),
            calibration: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        Ok(Self::with_params(ThermalNoiseParams::from_parameters(params)?))
    }

    pub fn with_noise(mut self, info: ThermalNoiseInfo) -> Self {
        self.noise.push(info);
        self
    }

    pub fn with_calibration(mut self, info: CalibrationInfo) -> Self {
        self.calibration.push(info);
        self
    }

    fn annotations(&self) -> SarResult<(Vec<ThermalNoiseInfo>, Vec<CalibrationInfo>)> {
        let wrap = |path: &PathBuf, e: SarError| {
            SarError::config(THERMAL_NOISE_ID, format!("{}: {}", path.display(), e))
        };
        let mut noise = self.noise.clone();
        for path in &self.params.noise_files {
            noise.push(ThermalNoiseInfo::from_file(path).map_err(|e| wrap(path, e))?);
        }
        let mut calibration = self.calibration.clone();
        for path in &self.params.calibration_files {
            calibration.push(CalibrationInfo::from_file(path).map_err(|e| wrap(path, e))?);
        }
        Ok((noise, calibration))
    }

    fn check_correction_flag(&self, source: &Product) -> SarResult<()> {
        let corrected = match source
            .abstracted_metadata()
            .and_then(|a| a.attribute(NOISE_CORRECTED_FLAG))
        {
            Some(MetadataValue::Text(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1"),
            Some(MetadataValue::Int(v)) => *v != 0,
            Some(MetadataValue::Float(v)) => *v != 0.0,
            None => false,
        };
        if self.params.remove && corrected {
            return Err(SarError::config(
                THERMAL_NOISE_ID,
                "thermal noise correction has already been performed for the product",
            ));
        }
        if self.params.reintroduce && !corrected {
            return Err(SarError::config(
                THERMAL_NOISE_ID,
                "thermal noise correction has never been performed for the product",
            ));
        }
        Ok(())
    }
}

impl Default for ThermalNoiseOp {
    fn default() -> Self {
        Self::new()
    }
}

fn timed_grid(
    source: &Product,
    first_line_time: f64,
    derived_interval: Option<f64>,
    build: impl Fn(f64) -> SarResult<LutGrid>,
) -> SarResult<LutGrid> {
    let (first, interval) = line_timing(THERMAL_NOISE_ID, source, first_line_time, derived_interval)?;
    let grid = build(interval).map_err(|e| SarError::config(THERMAL_NOISE_ID, e.to_string()))?;
    if first != first_line_time {
        return LutGrid::new(first, interval, grid.vectors().to_vec());
    }
    Ok(grid)
}

impl Operator for ThermalNoiseOp {
    fn id(&self) -> &str {
        self.ctx.id()
    }

    fn state(&self) -> OperatorState {
        self.ctx.state()
    }

    fn initialize(&mut self, source: Arc<Product>) -> SarResult<Arc<Product>> {
        self.params.validate()?;
        self.check_correction_flag(&source)?;
        let (noise, calibration) = self.annotations()?;
        if noise.is_empty() {
            return Err(SarError::config(THERMAL_NOISE_ID, "no noise annotation given"));
        }

        let pattern = polarization_regex(THERMAL_NOISE_ID)?;
        let mut target = source.derived("NR");
        self.targets.clear();

        for (suffix, input) in detected_inputs(THERMAL_NOISE_ID, &source)? {
            let primary = input.primary_band().to_string();
            let info = match_annotation(&suffix, &pattern, &noise, |a: &ThermalNoiseInfo| {
                (a.polarization.as_str(), a.swath.as_str())
            })
            .ok_or_else(|| {
                SarError::config(
                    THERMAL_NOISE_ID,
                    format!("no noise annotation matches band '{}'", primary),
                )
            })?;
            let noise_grid = timed_grid(
                &source,
                info.first_line_time,
                info.line_time_interval(source.height()),
                |interval| info.lut(interval),
            )?;

            let calibrated = match &input {
                DetectedInput::Intensity(band) => CalibrationType::of_band_name(band),
                _ => None,
            };
            let calibration_grid = match calibrated {
                None => None,
                Some(cal_type) => {
                    let cal = match_annotation(&suffix, &pattern, &calibration, |a: &CalibrationInfo| {
                        (a.polarization.as_str(), a.swath.as_str())
                    })
                    .ok_or_else(|| {
                        SarError::config(
                            THERMAL_NOISE_ID,
                            format!("band '{}' is calibrated but no calibration annotation matches", primary),
                        )
                    })?;
                    Some(timed_grid(
                        &source,
                        cal.first_line_time,
                        cal.line_time_interval(source.height()),
                        |interval| cal.lut(cal_type, interval),
                    )?)
                }
            };

            let name = match &input {
                DetectedInput::Intensity(band) => band.clone(),
                _ => format!("Intensity_{}", suffix),
            };
            let no_data = source.require_band(&primary)?.no_data_value();
            let mut band = Band::new(&name, Unit::Intensity, DataType::Float32, source.width(), source.height());
            if let Some(nd) = no_data {
                band = band.with_no_data(nd);
            }
            target.add_band(band)?;
            self.targets.push(NoiseTarget {
                band: name,
                input,
                noise: noise_grid,
                calibration: calibration_grid,
                no_data,
            });
        }

        let flag = if self.params.remove { "true" } else { "false" };
        if let Some(abs) = target.metadata_mut().element_mut(ABSTRACTED_METADATA) {
            abs.set_attribute(NOISE_CORRECTED_FLAG, flag);
        }

        log::info!(
            "Thermal noise: {} {} band(s)",
            if self.params.remove { "removing from" } else { "re-introducing into" },
            self.targets.len()
        );
        Ok(self.ctx.bind(source, target, true))
    }

    fn target_product(&self) -> Option<Arc<Product>> {
        self.ctx.target()
    }

    fn compute_tile(&self, band: &str, rect: &Rectangle) -> SarResult<RasterBuffer> {
        self.ctx.check_target_band(band)?;
        let target = self
            .targets
            .iter()
            .find(|t| t.band == band)
            .ok_or_else(|| SarError::OutOfRange(format!("No noise target '{}'", band)))?;

        let (dn2, raw) = target.input.intensity(self.ctx.provider()?, rect)?;
        let mut out = RasterBuffer::new(*rect, DataType::Float32, SampleKind::Real);
        for y in rect.y..rect.max_y() {
            let noise = target.noise_row(y, rect.x, rect.width);
            for (x, n) in (rect.x..rect.max_x()).zip(noise) {
                if target.no_data.map_or(false, |nd| raw.get(x, y) == nd) {
                    out.set(x, y, raw.get(x, y));
                    continue;
                }
                let v = dn2.get(x, y);
                let value = if self.params.remove {
                    let denoised = v - n;
                    // negative results keep the noisy intensity
                    if denoised < 0.0 {
                        v
                    } else {
                        denoised
                    }
                } else {
                    v + n
                };
                out.set(x, y, value);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calibrate::tests::CALIBRATION_XML;
    use crate::engine::product::MetadataElement;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use std::io::Write;

    const NOISE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<noise>
  <adsHeader>
    <polarisation>VV</polarisation>
    <swath>IW1</swath>
    <startTime>2020-01-15T05:40:00.000000</startTime>
    <stopTime>2020-01-15T05:40:09.000000</stopTime>
  </adsHeader>
  <noiseRangeVectorList count="2">
    <noiseRangeVector>
      <azimuthTime>2020-01-15T05:40:00.000000</azimuthTime>
      <line>0</line>
      <pixel count="3">0 4 8</pixel>
      <noiseRangeLut count="3">1.0 2.0 3.0</noiseRangeLut>
    </noiseRangeVector>
    <noiseRangeVector>
      <azimuthTime>2020-01-15T05:40:09.000000</azimuthTime>
      <line>9</line>
      <pixel count="3">0 4 8</pixel>
      <noiseRangeLut count="3">3.0 4.0 5.0</noiseRangeLut>
    </noiseRangeVector>
  </noiseRangeVectorList>
  <noiseAzimuthVectorList count="1">
    <noiseAzimuthVector>
      <firstAzimuthLine>0</firstAzimuthLine>
      <noiseAzimuthLut count="2">1.0 1.0</noiseAzimuthLut>
    </noiseAzimuthVector>
  </noiseAzimuthVectorList>
</noise>"#;

    fn product(band: &str, unit: Unit, value: f64, corrected: Option<&str>) -> Arc<Product> {
        let mut product = Product::new("grd", 9, 10);
        product
            .add_band(Band::with_data(band, unit, DataType::Float32, Array2::from_elem((10, 9), value)))
            .unwrap();
        let mut abs = MetadataElement::new(ABSTRACTED_METADATA);
        if let Some(flag) = corrected {
            abs.set_attribute(NOISE_CORRECTED_FLAG, flag);
        }
        product.metadata_mut().add_element(abs);
        Arc::new(product)
    }

    fn noise() -> ThermalNoiseInfo {
        ThermalNoiseInfo::from_xml(NOISE_XML).unwrap()
    }

    #[test]
    fn test_parse_range_vectors_only() {
        let info = noise();
        assert_eq!(info.vectors.len(), 2);
        assert_eq!(info.vectors[1].noise_lut, vec![3.0, 4.0, 5.0]);

        let legacy = NOISE_XML
            .replace("noiseRangeVector", "noiseVector")
            .replace("noiseRangeLut", "noiseLut");
        assert_eq!(ThermalNoiseInfo::from_xml(&legacy).unwrap().vectors, info.vectors);
    }

    #[test]
    fn test_remove_noise_with_negative_fallback() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut op = ThermalNoiseOp::new().with_noise(noise());
        let target = op.initialize(product("Amplitude_VV", Unit::Amplitude, 4.0, None)).unwrap();
        assert_eq!(target.band_names(), vec!["Intensity_VV"]);
        let tile = op.compute_tile("Intensity_VV", &Rectangle::of_size(9, 10)).unwrap();
        assert_abs_diff_eq!(tile.get(0, 0), 15.0, epsilon = 1e-5);
        assert_abs_diff_eq!(tile.get(8, 9), 11.0, epsilon = 1e-5);

        let mut op = ThermalNoiseOp::new().with_noise(noise());
        op.initialize(product("Amplitude_VV", Unit::Amplitude, 1.5, None)).unwrap();
        let tile = op.compute_tile("Intensity_VV", &Rectangle::new(0, 9, 9, 1)).unwrap();
        // 2.25 - 3.0 < 0
        assert_abs_diff_eq!(tile.get(0, 9), 2.25, epsilon = 1e-6);
        // 2.25 - 4.0 < 0
        assert_abs_diff_eq!(tile.get(4, 9), 2.25, epsilon = 1e-6);
    }

    #[test]
    fn test_reintroduce_requires_corrected_product() {
        let params = ThermalNoiseParams {
            remove: false,
            reintroduce: true,
            ..Default::default()
        };
        let mut op = ThermalNoiseOp::with_params(params.clone()).with_noise(noise());
        let err = op
            .initialize(product("Intensity_VV", Unit::Intensity, 10.0, None))
            .unwrap_err();
        assert!(err.is_configuration());

        let mut op = ThermalNoiseOp::with_params(params).with_noise(noise());
        let target = op
            .initialize(product("Intensity_VV", Unit::Intensity, 10.0, Some("true")))
            .unwrap();
        let abs = target.abstracted_metadata().unwrap();
        assert_eq!(abs.attribute_str(NOISE_CORRECTED_FLAG), Some("false"));
        let tile = op.compute_tile("Intensity_VV", &Rectangle::of_size(1, 1)).unwrap();
        assert_abs_diff_eq!(tile.get(0, 0), 11.0, epsilon = 1e-5);
    }

    #[test]
    fn test_already_corrected_is_rejected() {
        let mut op = ThermalNoiseOp::new().with_noise(noise());
        let err = op
            .initialize(product("Amplitude_VV", Unit::Amplitude, 4.0, Some("true")))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_calibrated_input_scales_noise() {
        let cal = CalibrationInfo::from_xml(CALIBRATION_XML).unwrap();
        let mut op = ThermalNoiseOp::new().with_noise(noise());
        assert!(op
            .initialize(product("Sigma0_VV", Unit::Intensity, 2.0, None))
            .unwrap_err()
            .is_configuration());

        let mut op = ThermalNoiseOp::new().with_noise(noise()).with_calibration(cal);
        let target = op.initialize(product("Sigma0_VV", Unit::Intensity, 2.0, None)).unwrap();
        assert_eq!(target.band_names(), vec!["Sigma0_VV"]);
        let tile = op.compute_tile("Sigma0_VV", &Rectangle::of_size(9, 10)).unwrap();
        // noise 1 / sigma0 2^2
        assert_abs_diff_eq!(tile.get(0, 0), 2.0 - 0.25, epsilon = 1e-6);
        // noise 5 / sigma0 16^2
        assert_abs_diff_eq!(tile.get(8, 9), 2.0 - 5.0 / 256.0, epsilon = 1e-6);
    }

    #[test]
    fn test_noise_file_parameters() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(NOISE_XML.as_bytes()).unwrap();
        let params = ParameterMap::new().with("noiseFiles", file.path().display());
        let mut op = ThermalNoiseOp::from_parameters(&params).unwrap();
        op.initialize(product("Amplitude_VV", Unit::Amplitude, 4.0, None)).unwrap();
        assert_eq!(op.state(), OperatorState::Ready);

        let both = ThermalNoiseParams {
            reintroduce: true,
            ..Default::default()
        };
        assert!(both.validate().unwrap_err().is_configuration());
    }
}
