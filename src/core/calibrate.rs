use crate::core::lut::{parse_list, parse_utc_seconds, LutGrid, LutVector};
use crate::engine::buffer::{DataType, RasterBuffer, SampleKind};
use crate::engine::complex::build_containers;
use crate::engine::operator::{Operator, OperatorContext, OperatorState};
use crate::engine::params::ParameterMap;
use crate::engine::product::{Band, Product, Unit};
use crate::engine::provider::{BorderPolicy, TileProvider};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarError, SarResult};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CALIBRATION_ID: &str = "Calibration";

/// dB value written for non-positive linear values
pub const DB_FLOOR: f64 = -50.0;

/// Calibration vector from a Sentinel-1 calibration annotation
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationVector {
    pub azimuth_time: f64,
    pub line: i64,
    pub pixels: Vec<i64>,
    pub sigma_nought: Vec<f64>,
    pub beta_nought: Vec<f64>,
    pub gamma: Vec<f64>,
    pub dn: Vec<f64>,
}

/// Calibration annotation of one swath/polarisation
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationInfo {
    pub polarization: String,
    pub swath: String,
    pub first_line_time: f64,
    pub last_line_time: f64,
    pub vectors: Vec<CalibrationVector>,
}

/// Types of radiometric calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationType {
    Sigma0,
    Beta0,
    Gamma0,
    Dn,
}

impl CalibrationType {
    /// Target band name prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            CalibrationType::Sigma0 => "Sigma0",
            CalibrationType::Beta0 => "Beta0",
            CalibrationType::Gamma0 => "Gamma0",
            CalibrationType::Dn => "DN",
        }
    }

    pub fn parse(operator: &str, text: &str) -> SarResult<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "sigma0" => Ok(CalibrationType::Sigma0),
            "beta0" => Ok(CalibrationType::Beta0),
            "gamma0" | "gamma" => Ok(CalibrationType::Gamma0),
            "dn" => Ok(CalibrationType::Dn),
            other => Err(SarError::config(
                operator,
                format!("unknown calibration type '{}'", other),
            )),
        }
    }

    /// Calibration already applied to a band, judged by its name prefix
    pub fn of_band_name(name: &str) -> Option<Self> {
        [
            CalibrationType::Sigma0,
            CalibrationType::Beta0,
            CalibrationType::Gamma0,
        ]
        .into_iter()
        .find(|t| name.starts_with(t.prefix()))
    }
}

impl CalibrationVector {
    fn values(&self, cal_type: CalibrationType) -> &[f64] {
        match cal_type {
            CalibrationType::Sigma0 => &self.sigma_nought,
            CalibrationType::Beta0 => &self.beta_nought,
            CalibrationType::Gamma0 => &self.gamma,
            CalibrationType::Dn => &self.dn,
        }
    }
}

impl CalibrationInfo {
    /// Parse a Sentinel-1 calibration annotation
    pub fn from_xml(xml_content: &str) -> SarResult<Self> {
        log::debug!("Parsing calibration XML content ({} bytes)", xml_content.len());

        let mut reader = Reader::from_str(xml_content);
        reader.trim_text(true);

        let mut info = CalibrationInfo {
            polarization: String::new(),
            swath: String::new(),
            first_line_time: 0.0,
            last_line_time: 0.0,
            vectors: Vec::new(),
        };
        let mut buf = Vec::new();
        let mut in_ads_header = false;
        let mut current: Option<CalibrationVector> = None;
        let mut current_tag = String::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match current_tag.as_str() {
                        "adsHeader" => in_ads_header = true,
                        "calibrationVector" => {
                            current = Some(CalibrationVector {
                                azimuth_time: 0.0,
                                line: 0,
                                pixels: Vec::new(),
                                sigma_nought: Vec::new(),
                                beta_nought: Vec::new(),
                                gamma: Vec::new(),
                                dn: Vec::new(),
                            })
                        }
                        _ => {}
                    }
                }
                Ok(Event::End(ref e)) => {
                    match e.name().as_ref() {
                        b"adsHeader" => in_ads_header = false,
                        b"calibrationVector" => {
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
                            "sigmaNought" => vector.sigma_nought = parse_list(&text, tag)?,
                            "betaNought" => vector.beta_nought = parse_list(&text, tag)?,
                            "gamma" => vector.gamma = parse_list(&text, tag)?,
                            "dn" => vector.dn = parse_list(&text, tag)?,
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
            "Parsed {} calibration vectors for swath {} polarization {}",
            info.vectors.len(),
            info.swath,
            info.polarization
        );

        if info.vectors.is_empty() {
            return Err(SarError::XmlParsing(
                "No calibration vectors found in XML".to_string(),
            ));
        }
        Ok(info)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> SarResult<Self> {
        let xml = std::fs::read_to_string(path.as_ref())?;
        Self::from_xml(&xml)
    }

    /// Line spacing derived from the annotated start/stop times
    pub fn line_time_interval(&self, num_lines: usize) -> Option<f64> {
        if num_lines < 2 || self.last_line_time <= self.first_line_time {
            return None;
        }
        Some((self.last_line_time - self.first_line_time) / (num_lines - 1) as f64)
    }

    /// Interpolation grid of one calibration type
    pub fn lut(&self, cal_type: CalibrationType, line_time_interval: f64) -> SarResult<LutGrid> {
        let vectors = self
            .vectors
            .iter()
            .map(|v| LutVector {
                azimuth_time: v.azimuth_time,
                line: v.line,
                pixels: v.pixels.clone(),
                values: v.values(cal_type).to_vec(),
            })
            .collect();
        LutGrid::new(self.first_line_time, line_time_interval, vectors)
    }
}

/// Convert linear intensity to dB
pub fn to_db(value: f64) -> f64 {
    if value > 0.0 {
        10.0 * value.log10()
    } else {
        DB_FLOOR
    }
}

/// Where the |DN|^2 of a target band comes from
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DetectedInput {
    Complex { real: String, imag: String },
    Amplitude(String),
    Intensity(String),
}

impl DetectedInput {
    pub(crate) fn primary_band(&self) -> &str {
        match self {
            DetectedInput::Complex { real, .. } => real,
            DetectedInput::Amplitude(band) | DetectedInput::Intensity(band) => band,
        }
    }

    /// |DN|^2 over `rect` plus the raw primary samples for no-data checks
    pub(crate) fn intensity(
        &self,
        provider: &dyn TileProvider,
        rect: &Rectangle,
    ) -> SarResult<(RasterBuffer, RasterBuffer)> {
        let primary = provider.get_tile(self.primary_band(), rect, BorderPolicy::ZeroExtend)?;
        let mut out = RasterBuffer::new(*rect, DataType::Float64, SampleKind::Real);
        match self {
            DetectedInput::Complex { imag, .. } => {
                let q = provider.get_tile(imag, rect, BorderPolicy::ZeroExtend)?;
                for y in rect.y..rect.max_y() {
                    for x in rect.x..rect.max_x() {
                        let i = primary.get(x, y);
                        let q = q.get(x, y);
                        out.set(x, y, i * i + q * q);
                    }
                }
            }
            DetectedInput::Amplitude(_) => {
                for y in rect.y..rect.max_y() {
                    for x in rect.x..rect.max_x() {
                        let a = primary.get(x, y);
                        out.set(x, y, a * a);
                    }
                }
            }
            DetectedInput::Intensity(_) => out.copy_from(&primary)?,
        }
        Ok((out, primary))
    }
}

/// Detected inputs of a product, keyed by the name suffix used for targets
/// (`IW1_VV` for `i_IW1_VV`, `VV` for `Amplitude_VV`).
pub(crate) fn detected_inputs(operator: &str, source: &Product) -> SarResult<Vec<(String, DetectedInput)>> {
    let mut inputs: Vec<(String, DetectedInput)> = build_containers(operator, source)?
        .into_iter()
        .map(|c| {
            (
                c.name,
                DetectedInput::Complex {
                    real: c.real_band,
                    imag: c.imag_band,
                },
            )
        })
        .collect();

    for band in source.bands().iter().filter(|b| !b.is_virtual()) {
        let input = match band.unit() {
            Unit::Amplitude => DetectedInput::Amplitude(band.name().to_string()),
            Unit::Intensity => DetectedInput::Intensity(band.name().to_string()),
            _ => continue,
        };
        let suffix = band
            .name()
            .split_once('_')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| band.name().to_string());
        inputs.push((suffix, input));
    }

    if inputs.is_empty() {
        return Err(SarError::config(
            operator,
            "no complex, amplitude or intensity bands in the source product",
        ));
    }
    Ok(inputs)
}

pub(crate) fn polarization_regex(operator: &str) -> SarResult<Regex> {
    Regex::new(r"(?i)(?:^|_)(HH|HV|VH|VV)(?:_|$)")
        .map_err(|e| SarError::config(operator, format!("polarisation pattern: {}", e)))
}

/// Annotation matching a band name by polarisation, preferring one whose
/// swath also appears in the name.
pub(crate) fn match_annotation<'a, T>(
    name: &str,
    pattern: &Regex,
    annotations: &'a [T],
    key: impl Fn(&T) -> (&str, &str),
) -> Option<&'a T> {
    let pol = pattern.captures(name)?.get(1)?.as_str().to_ascii_uppercase();
    let upper = name.to_ascii_uppercase();
    let candidates: Vec<&T> = annotations
        .iter()
        .filter(|a| key(*a).0.eq_ignore_ascii_case(&pol))
        .collect();
    candidates
        .iter()
        .find(|a| {
            let swath = key(**a).1;
            !swath.is_empty() && upper.contains(&swath.to_ascii_uppercase())
        })
        .or_else(|| candidates.first())
        .copied()
}

/// Line timing for a LUT: explicit metadata first, then the annotation.
pub(crate) fn line_timing(
    operator: &str,
    source: &Product,
    first_line_time: f64,
    derived_interval: Option<f64>,
) -> SarResult<(f64, f64)> {
    let abs = source.abstracted_metadata();
    let first = abs
        .and_then(|a| a.attribute_f64("first_line_time"))
        .unwrap_or(first_line_time);
    let interval = abs
        .and_then(|a| a.attribute_f64("line_time_interval"))
        .or(derived_interval)
        .ok_or_else(|| SarError::config(operator, "line time interval is unknown"))?;
    Ok((first, interval))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub calibration_type: CalibrationType,
    pub output_db: bool,
    /// Calibration annotation files loaded at initialisation
    pub calibration_files: Vec<PathBuf>,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            calibration_type: CalibrationType::Sigma0,
            output_db: false,
            calibration_files: Vec::new(),
        }
    }
}

impl CalibrationParams {
    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        let calibration_type = match params.get_str("calibrationType") {
            Some(t) => CalibrationType::parse(CALIBRATION_ID, t)?,
            None => CalibrationType::Sigma0,
        };
        Ok(Self {
            calibration_type,
            output_db: params.get_bool(CALIBRATION_ID, "outputImageScaleInDb", false)?,
            calibration_files: params
                .get_list("calibrationFiles")
                .into_iter()
                .map(PathBuf::from)
                .collect(),
        })
    }
}

#[derive(Debug, Clone)]
struct CalibrationTarget {
    band: String,
    input: DetectedInput,
    lut: LutGrid,
    no_data: Option<f64>,
}

/// Radiometric calibration: `|DN|^2 / LUT^2` per pixel
#[derive(Debug)]
pub struct CalibrationOp {
    ctx: OperatorContext,
    params: CalibrationParams,
    annotations: Vec<CalibrationInfo>,
    targets: Vec<CalibrationTarget>,
}

impl CalibrationOp {
    pub fn new() -> Self {
        Self::with_params(CalibrationParams::default())
    }

    pub fn with_params(params: CalibrationParams) -> Self {
        Self {
            ctx: OperatorContext::new(CALIBRATION_ID),
            params,
            annotations: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        Ok(Self::with_params(CalibrationParams::from_parameters(params)?))
    }

    /// Use an already parsed annotation in addition to any files
    pub fn with_calibration(mut self, info: CalibrationInfo) -> Self {
        self.annotations.push(info);
        self
    }

    fn load_files(&self) -> SarResult<Vec<CalibrationInfo>> {
        self.params
            .calibration_files
            .iter()
            .map(|path| {
                CalibrationInfo::from_file(path).map_err(|e| {
                    SarError::config(CALIBRATION_ID, format!("{}: {}", path.display(), e))
                })
            })
            .collect()
    }
}

impl Default for CalibrationOp {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for CalibrationOp {
    fn id(&self) -> &str {
        self.ctx.id()
    }

    fn state(&self) -> OperatorState {
        self.ctx.state()
    }

    fn initialize(&mut self, source: Arc<Product>) -> SarResult<Arc<Product>> {
        let mut annotations = self.annotations.clone();
        annotations.extend(self.load_files()?);
        if annotations.is_empty() {
            return Err(SarError::config(CALIBRATION_ID, "no calibration annotation given"));
        }

        let pattern = polarization_regex(CALIBRATION_ID)?;
        let cal_type = self.params.calibration_type;
        let mut target = source.derived("Cal");
        self.targets.clear();

        for (suffix, input) in detected_inputs(CALIBRATION_ID, &source)? {
            let info = match_annotation(&suffix, &pattern, &annotations, |a: &CalibrationInfo| {
                (a.polarization.as_str(), a.swath.as_str())
            })
            .ok_or_else(|| {
                SarError::config(
                    CALIBRATION_ID,
                    format!("no calibration annotation matches band '{}'", input.primary_band()),
                )
            })?;

            let (first, interval) = line_timing(
                CALIBRATION_ID,
                &source,
                info.first_line_time,
                info.line_time_interval(source.height()),
            )?;
            let mut lut = info
                .lut(cal_type, interval)
                .map_err(|e| SarError::config(CALIBRATION_ID, e.to_string()))?;
            if first != info.first_line_time {
                lut = LutGrid::new(first, interval, lut.vectors().to_vec())?;
            }

            let name = format!("{}_{}", cal_type.prefix(), suffix);
            let no_data = source.require_band(input.primary_band())?.no_data_value();
            let unit = if self.params.output_db {
                Unit::IntensityDb
            } else {
                Unit::Intensity
            };
            let mut band = Band::new(&name, unit, DataType::Float32, source.width(), source.height());
            if let Some(nd) = no_data {
                band = band.with_no_data(nd);
            }
            target.add_band(band)?;
            self.targets.push(CalibrationTarget {
                band: name,
                input,
                lut,
                no_data,
            });
        }

        log::info!(
            "Calibration: {} band(s) to {}{}",
            self.targets.len(),
            cal_type.prefix(),
            if self.params.output_db { " [dB]" } else { "" }
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
            .ok_or_else(|| SarError::OutOfRange(format!("No calibration target '{}'", band)))?;

        let (dn2, raw) = target.input.intensity(self.ctx.provider()?, rect)?;
        let mut out = RasterBuffer::new(*rect, DataType::Float32, SampleKind::Real);
        for y in rect.y..rect.max_y() {
            let lut = target.lut.row(y, rect.x, rect.width);
            for (x, a) in (rect.x..rect.max_x()).zip(lut) {
                if target.no_data.map_or(false, |nd| raw.get(x, y) == nd) {
                    out.set(x, y, raw.get(x, y));
                    continue;
                }
                let value = if a > 0.0 { dn2.get(x, y) / (a * a) } else { 0.0 };
                out.set(x, y, if self.params.output_db { to_db(value) } else { value });
            }
        }
        Ok(out)
    }
}
