//! Pixel-space addressing: rectangles, halos and flat tile indexing.

use crate::types::{SarError, SarResult};
use serde::{Deserialize, Serialize};

/// Rectangular region in image-pixel space.
///
/// The origin is signed so that halo-expanded rectangles may reach past the
/// top/left image border; extents are never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: i64,
    pub y: i64,
    pub width: usize,
    pub height: usize,
}

/// Extra border of source pixels a kernel needs around its output rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Halo {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

impl Halo {
    pub const NONE: Halo = Halo {
        left: 0,
        right: 0,
        top: 0,
        bottom: 0,
    };

    pub fn symmetric(horizontal: usize, vertical: usize) -> Self {
        Self {
            left: horizontal,
            right: horizontal,
            top: vertical,
            bottom: vertical,
        }
    }

    /// Halo of a `win_range` x `win_azimuth` estimation window centred on the
    /// output pixel. The leading side gets `floor((w - 1) / 2)`, the trailing
    /// side the rest, so even windows extend one pixel further right/down.
    pub fn for_window(win_range: usize, win_azimuth: usize) -> Self {
        let lead_rg = win_range.saturating_sub(1) / 2;
        let lead_az = win_azimuth.saturating_sub(1) / 2;
        Self {
            left: lead_rg,
            right: win_range.saturating_sub(1) - lead_rg,
            top: lead_az,
            bottom: win_azimuth.saturating_sub(1) - lead_az,
        }
    }
}

impl Rectangle {
    pub fn new(x: i64, y: i64, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Full raster of the given size.
    pub fn of_size(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    /// Exclusive right edge.
    pub fn max_x(&self) -> i64 {
        self.x + self.width as i64
    }

    /// Exclusive bottom edge.
    pub fn max_y(&self) -> i64 {
        self.y + self.height as i64
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.x && x < self.max_x() && y >= self.y && y < self.max_y()
    }

    pub fn contains_rect(&self, other: &Rectangle) -> bool {
        other.is_empty()
            || (other.x >= self.x
                && other.y >= self.y
                && other.max_x() <= self.max_x()
                && other.max_y() <= self.max_y())
    }

    /// New rectangle grown by the halo on every side.
    pub fn expand(&self, halo: Halo) -> Rectangle {
        Rectangle {
            x: self.x - halo.left as i64,
            y: self.y - halo.top as i64,
            width: self.width + halo.left + halo.right,
            height: self.height + halo.top + halo.bottom,
        }
    }

    pub fn intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.max_x().min(other.max_x());
        let y1 = self.max_y().min(other.max_y());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rectangle::new(x0, y0, (x1 - x0) as usize, (y1 - y0) as usize))
    }

    /// Intersection with a `width` x `height` raster anchored at the origin.
    pub fn clip_to(&self, width: usize, height: usize) -> Option<Rectangle> {
        self.intersection(&Rectangle::of_size(width, height))
    }

    /// Split `[0, width) x [0, height)` into tiles of at most
    /// `tile_width` x `tile_height`, row-major.
    pub fn tiles(
        width: usize,
        height: usize,
        tile_width: usize,
        tile_height: usize,
    ) -> SarResult<Vec<Rectangle>> {
        if tile_width == 0 || tile_height == 0 {
            return Err(SarError::OutOfRange(format!(
                "Tile size must be positive, got {}x{}",
                tile_width, tile_height
            )));
        }

        let mut tiles = Vec::new();
        for y in (0..height).step_by(tile_height) {
            let h = tile_height.min(height - y);
            for x in (0..width).step_by(tile_width) {
                let w = tile_width.min(width - x);
                tiles.push(Rectangle::new(x as i64, y as i64, w, h));
            }
        }
        Ok(tiles)
    }
}

impl std::fmt::Display for Rectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}x{}]", self.x, self.y, self.width, self.height)
    }
}

/// Maps absolute image coordinates to flat offsets inside a rectangle.
///
/// Call [`TileIndex::calculate_stride`] once per row, then [`TileIndex::index`]
/// for each column of that row.
#[derive(Debug, Clone)]
pub struct TileIndex {
    rect: Rectangle,
    components: usize,
    row_offset: usize,
}

impl TileIndex {
    pub fn new(rect: Rectangle, components: usize) -> Self {
        Self {
            rect,
            components: components.max(1),
            row_offset: 0,
        }
    }

    pub fn calculate_stride(&mut self, y: i64) {
        debug_assert!(y >= self.rect.y && y < self.rect.max_y());
        self.row_offset = (y - self.rect.y) as usize * self.rect.width * self.components;
    }

    /// Offset of the first component of pixel `x` in the current row.
    pub fn index(&self, x: i64) -> usize {
        debug_assert!(x >= self.rect.x && x < self.rect.max_x());
        self.row_offset + (x - self.rect.x) as usize * self.components
    }

    /// Offset of `(x, y)` without touching the cached row stride.
    pub fn offset(&self, x: i64, y: i64) -> usize {
        ((y - self.rect.y) as usize * self.rect.width + (x - self.rect.x) as usize)
            * self.components
    }

    pub fn rectangle(&self) -> Rectangle {
        self.rect
    }
}
