//! Pairing of real/imaginary bands into complex acquisitions.

use crate::engine::product::{MetadataElement, Product, Unit};
use crate::types::{SarError, SarResult};

/// One complex acquisition: an i/q band pair plus its metadata.
#[derive(Debug, Clone)]
pub struct CplxContainer {
    /// Band name without the `i_`/`q_` prefix, e.g. `IW1_VV_slv1_15Jan2020`
    pub name: String,
    pub real_band: String,
    pub imag_band: String,
    pub is_master: bool,
    pub metadata: MetadataElement,
}

impl CplxContainer {
    /// Acquisition attribute, falling back to the product's abstracted metadata.
    pub fn attribute_f64(&self, key: &str, product: &Product) -> Option<f64> {
        self.metadata
            .attribute_f64(key)
            .or_else(|| product.abstracted_metadata()?.attribute_f64(key))
    }

    /// Polarisation token of the name, e.g. `VH`
    pub fn polarisation(&self) -> Option<&str> {
        name_token(&self.name, |t| POLARISATIONS.iter().any(|p| t.eq_ignore_ascii_case(p)))
    }

    /// Sub-swath token of the name, e.g. `IW2`
    pub fn swath(&self) -> Option<&str> {
        name_token(&self.name, |t| match (t.get(..2), t.get(2..)) {
            (Some(mode), Some(index)) => {
                (mode.eq_ignore_ascii_case("IW") || mode.eq_ignore_ascii_case("EW"))
                    && !index.is_empty()
                    && index.bytes().all(|b| b.is_ascii_digit())
            }
            _ => false,
        })
    }

    fn acquisition_key(&self) -> (Option<String>, Option<String>) {
        (
            self.polarisation().map(str::to_ascii_uppercase),
            self.swath().map(str::to_ascii_uppercase),
        )
    }
}

const POLARISATIONS: [&str; 4] = ["HH", "HV", "VH", "VV"];

fn name_token(name: &str, accept: impl Fn(&str) -> bool) -> Option<&str> {
    name.split('_').find(|t| accept(*t))
}

fn same_token(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

fn compatible_token(a: Option<&str>, b: Option<&str>) -> bool {
    a.is_none() || b.is_none() || same_token(a, b)
}

/// Master acquisition for `slave`: the master with the same polarisation and
/// swath, else one whose tokens do not contradict the slave's.
pub fn master_for<'a>(slave: &CplxContainer, containers: &'a [CplxContainer]) -> Option<&'a CplxContainer> {
    let masters = || containers.iter().filter(|c| c.is_master);
    masters()
        .find(|m| same_token(m.polarisation(), slave.polarisation()) && same_token(m.swath(), slave.swath()))
        .or_else(|| {
            masters().find(|m| {
                compatible_token(m.polarisation(), slave.polarisation())
                    && compatible_token(m.swath(), slave.swath())
            })
        })
}

/// Every slave of the stack paired with its own master.
///
/// Slaves without a master of the same polarisation and swath are skipped;
/// a stack left with no pair is a configuration error.
pub fn master_slave_pairs(
    operator: &str,
    containers: &[CplxContainer],
) -> SarResult<Vec<(CplxContainer, CplxContainer)>> {
    if !containers.iter().any(|c| c.is_master) {
        return Err(SarError::config(operator, "no master acquisition found"));
    }
    let mut pairs = Vec::new();
    for slave in containers.iter().filter(|c| !c.is_master) {
        match master_for(slave, containers) {
            Some(master) => pairs.push((master.clone(), slave.clone())),
            None => log::warn!(
                "{}: no master shares polarisation and swath with '{}', skipped",
                operator,
                slave.name
            ),
        }
    }
    if pairs.is_empty() {
        return Err(SarError::config(operator, "a coregistered slave is required"));
    }
    Ok(pairs)
}

fn strip_component_prefix(name: &str, prefix: &str) -> Option<String> {
    name.strip_prefix(prefix).map(|rest| rest.to_string())
}

/// Scan `product` for i/q pairs.
///
/// A real band `i_<name>` pairs with the imaginary band `q_<name>`; a real band
/// without prefix pairs with the band that immediately follows it when that
/// band is imaginary. Unpaired components are a configuration error.
/// Masters are the containers tagged `_mst`. When no band carries the tag the
/// first container of each polarisation and swath is the master.
pub fn build_containers(operator: &str, product: &Product) -> SarResult<Vec<CplxContainer>> {
    let bands = product.bands();
    let mut containers = Vec::new();
    let mut paired_imag: Vec<&str> = Vec::new();

    for (i, band) in bands.iter().enumerate() {
        if band.unit() != Unit::Real {
            continue;
        }

        let (name, imag) = match strip_component_prefix(band.name(), "i_") {
            Some(rest) => {
                let imag_name = format!("q_{}", rest);
                let imag = product
                    .band(&imag_name)
                    .filter(|b| b.unit() == Unit::Imaginary);
                (rest, imag)
            }
            None => {
                let imag = bands.get(i + 1).filter(|b| b.unit() == Unit::Imaginary);
                (band.name().to_string(), imag)
            }
        };

        let imag = imag.ok_or_else(|| {
            SarError::config(
                operator,
                format!("Real band '{}' has no matching imaginary band", band.name()),
            )
        })?;

        if imag.width() != band.width() || imag.height() != band.height() {
            return Err(SarError::config(
                operator,
                format!("Bands '{}' and '{}' differ in raster size", band.name(), imag.name()),
            ));
        }

        paired_imag.push(imag.name());
        let metadata = product
            .abstracted_metadata()
            .and_then(|abs| abs.element(&name))
            .cloned()
            .unwrap_or_else(|| MetadataElement::new(&name));

        containers.push(CplxContainer {
            is_master: name.contains("_mst"),
            name,
            real_band: band.name().to_string(),
            imag_band: imag.name().to_string(),
            metadata,
        });
    }

    if let Some(orphan) = bands
        .iter()
        .find(|b| b.unit() == Unit::Imaginary && !paired_imag.contains(&b.name()))
    {
        return Err(SarError::config(
            operator,
            format!("Imaginary band '{}' has no matching real band", orphan.name()),
        ));
    }

    if !containers.iter().any(|c| c.is_master) {
        let mut seen = Vec::new();
        for container in containers.iter_mut() {
            let key = container.acquisition_key();
            if !seen.contains(&key) {
                seen.push(key);
                container.is_master = true;
            }
        }
    }

    log::debug!("Found {} complex band pairs in '{}'", containers.len(), product.name());
    Ok(containers)
}
