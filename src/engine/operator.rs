//! Operator contract, lifecycle state and the once-only training latch.

use crate::engine::buffer::RasterBuffer;
use crate::engine::product::Product;
use crate::engine::provider::ProductTileProvider;
use crate::engine::rectangle::Rectangle;
use crate::types::{SarError, SarResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Lifecycle of an operator instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    Uninitialized,
    Initialized,
    Training,
    Trained,
    Ready,
}

impl OperatorState {
    fn as_u8(self) -> u8 {
        match self {
            OperatorState::Uninitialized => 0,
            OperatorState::Initialized => 1,
            OperatorState::Training => 2,
            OperatorState::Trained => 3,
            OperatorState::Ready => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => OperatorState::Initialized,
            2 => OperatorState::Training,
            3 => OperatorState::Trained,
            4 => OperatorState::Ready,
            _ => OperatorState::Uninitialized,
        }
    }
}

/// Lock-free cell holding an [`OperatorState`], readable from tile workers.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn get(&self) -> OperatorState {
        OperatorState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: OperatorState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// A raster operator.
///
/// `initialize` declares the target product from the source product and the
/// operator parameters. Afterwards any number of threads may request tiles
/// concurrently through a shared reference.
pub trait Operator: Send + Sync {
    /// Registry alias, also used to tag errors
    fn id(&self) -> &str;

    fn state(&self) -> OperatorState;

    /// Validate the source product and declare target bands.
    ///
    /// Calling it again re-validates and rebuilds the target product from
    /// scratch, so bands are never duplicated.
    fn initialize(&mut self, source: Arc<Product>) -> SarResult<Arc<Product>>;

    fn target_product(&self) -> Option<Arc<Product>>;

    /// Compute one target band over `rect`.
    fn compute_tile(&self, band: &str, rect: &Rectangle) -> SarResult<RasterBuffer>;

    /// Whether [`Operator::compute_tile_stack`] is the preferred entry point
    fn produces_tile_stack(&self) -> bool {
        false
    }

    /// Compute every non-virtual target band over `rect`.
    ///
    /// Either all buffers are returned or none.
    fn compute_tile_stack(&self, rect: &Rectangle) -> SarResult<BTreeMap<String, RasterBuffer>> {
        let target = self.target_product().ok_or_else(|| not_initialized(self.id()))?;
        let mut tiles = BTreeMap::new();
        for name in computed_bands(&target) {
            let tile = self.compute_tile(&name, rect)?;
            tiles.insert(name, tile);
        }
        Ok(tiles)
    }
}

/// Names of the target bands that carry data (virtual bands excluded)
pub fn computed_bands(product: &Product) -> Vec<String> {
    product
        .bands()
        .iter()
        .filter(|b| !b.is_virtual())
        .map(|b| b.name().to_string())
        .collect()
}

pub(crate) fn not_initialized(operator: &str) -> SarError {
    SarError::config(operator, "operator has not been initialized")
}

/// Source/target bookkeeping shared by all operator implementations
#[derive(Debug)]
pub struct OperatorContext {
    id: String,
    source: Option<Arc<Product>>,
    target: Option<Arc<Product>>,
    provider: Option<ProductTileProvider>,
    state: StateCell,
}

impl OperatorContext {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            source: None,
            target: None,
            provider: None,
            state: StateCell::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> OperatorState {
        self.state.get()
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    /// Record a validated source and its declared target.
    pub fn bind(&mut self, source: Arc<Product>, target: Product, ready: bool) -> Arc<Product> {
        let target = Arc::new(target);
        self.provider = Some(ProductTileProvider::new(source.clone()));
        self.source = Some(source);
        self.target = Some(target.clone());
        self.state.set(if ready {
            OperatorState::Ready
        } else {
            OperatorState::Initialized
        });
        target
    }

    pub fn source(&self) -> SarResult<&Arc<Product>> {
        self.source.as_ref().ok_or_else(|| not_initialized(&self.id))
    }

    pub fn target(&self) -> Option<Arc<Product>> {
        self.target.clone()
    }

    pub fn provider(&self) -> SarResult<&ProductTileProvider> {
        self.provider.as_ref().ok_or_else(|| not_initialized(&self.id))
    }

    /// Fail unless `band` is a declared, non-virtual target band.
    pub fn check_target_band(&self, band: &str) -> SarResult<()> {
        let target = self.target.as_ref().ok_or_else(|| not_initialized(&self.id))?;
        match target.band(band) {
            Some(b) if !b.is_virtual() => Ok(()),
            Some(_) => Err(SarError::OutOfRange(format!(
                "Band '{}' of {} is virtual and has no tiles",
                band, self.id
            ))),
            None => Err(SarError::OutOfRange(format!(
                "Band '{}' is not a target band of {}",
                band, self.id
            ))),
        }
    }
}

enum LatchSlot<M> {
    Untrained,
    Trained(Arc<M>),
    Failed(String),
}

/// Runs a training closure at most once and hands every caller the same model.
///
/// The first caller trains while holding the lock; concurrent callers block
/// until the model is published. A failed training is remembered and every
/// later request fails with the same message.
pub struct TrainingLatch<M> {
    slot: Mutex<LatchSlot<M>>,
    passes: AtomicUsize,
}

impl<M> Default for TrainingLatch<M> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(LatchSlot::Untrained),
            passes: AtomicUsize::new(0),
        }
    }
}

impl<M> std::fmt::Debug for TrainingLatch<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingLatch")
            .field("passes", &self.training_passes())
            .finish()
    }
}

impl<M> TrainingLatch<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the training closure actually ran
    pub fn training_passes(&self) -> usize {
        self.passes.load(Ordering::Acquire)
    }

    /// Model if training already succeeded
    pub fn model(&self) -> Option<Arc<M>> {
        match &*self.slot.lock() {
            LatchSlot::Trained(model) => Some(model.clone()),
            _ => None,
        }
    }

    /// Forget any model; used when an operator is re-initialized.
    pub fn reset(&mut self) {
        *self.slot.get_mut() = LatchSlot::Untrained;
    }

    /// Return the trained model, running `train` first if nobody has yet.
    ///
    /// `train` must not request tiles from the operator that owns this latch.
    pub fn get_or_train<F>(&self, operator: &str, state: &StateCell, train: F) -> SarResult<Arc<M>>
    where
        F: FnOnce() -> SarResult<M>,
    {
        let mut slot = self.slot.lock();
        match &*slot {
            LatchSlot::Trained(model) => return Ok(model.clone()),
            LatchSlot::Failed(message) => {
                return Err(SarError::compute(
                    operator,
                    format!("training failed earlier: {}", message),
                ))
            }
            LatchSlot::Untrained => {}
        }

        state.set(OperatorState::Training);
        self.passes.fetch_add(1, Ordering::AcqRel);
        log::info!("{}: training on the full source raster", operator);

        match train() {
            Ok(model) => {
                let model = Arc::new(model);
                *slot = LatchSlot::Trained(model.clone());
                state.set(OperatorState::Trained);
                log::info!("{}: training complete", operator);
                Ok(model)
            }
            Err(e) => {
                log::warn!("{}: training failed: {}", operator, e);
                *slot = LatchSlot::Failed(e.to_string());
                state.set(OperatorState::Initialized);
                Err(e)
            }
        }
    }
}
