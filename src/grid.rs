use geo::{coord, LineString, Polygon, Rect};

/// Axis-aligned bounding box, coordinates in the units of whatever CRS
/// the caller is working in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Bounds {
        Bounds { min_x, min_y, max_x, max_y }
    }

    pub fn from_rect(rect: Rect<f64>) -> Bounds {
        Bounds {
            min_x: rect.min().x,
            min_y: rect.min().y,
            max_x: rect.max().x,
            max_y: rect.max().y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                (self.min_x, self.min_y),
                (self.max_x, self.min_y),
                (self.max_x, self.max_y),
                (self.min_x, self.max_y),
                (self.min_x, self.min_y),
            ]),
            vec![],
        )
    }

    pub fn contains(&self, other: &Bounds) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
        ]
    }
}

/// Shrink a bbox by half a pixel on the west and north edges so the
/// outward snap of a rebuild lands on the same pixel grid instead of
/// growing by one row/column.
pub fn adjust_bbox_to_resolution(b: Bounds, resolution: f64) -> Bounds {
    Bounds {
        min_x: b.min_x + resolution / 2.0,
        min_y: b.min_y,
        max_x: b.max_x,
        max_y: b.max_y - resolution / 2.0,
    }
}

/// A realized pixel grid. Row 0 is the northernmost row; x ascends with
/// the column index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub epsg: u32,
    pub resolution: f64,
    pub bounds: Bounds,
    pub width: usize,
    pub height: usize,
}

impl GridSpec {
    /// Snap requested bounds outward to whole pixels of `resolution`.
    pub fn snap(epsg: u32, resolution: f64, b: Bounds) -> GridSpec {
        let min_x = (b.min_x / resolution).floor() * resolution;
        let min_y = (b.min_y / resolution).floor() * resolution;
        let max_x = (b.max_x / resolution).ceil() * resolution;
        let max_y = (b.max_y / resolution).ceil() * resolution;
        let width = ((max_x - min_x) / resolution).round().max(1.0) as usize;
        let height = ((max_y - min_y) / resolution).round().max(1.0) as usize;
        GridSpec {
            epsg,
            resolution,
            bounds: Bounds { min_x, min_y, max_x, max_y },
            width,
            height,
        }
    }

    /// Projected coordinates of a pixel center.
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.bounds.min_x + (col as f64 + 0.5) * self.resolution,
            self.bounds.max_y - (row as f64 + 0.5) * self.resolution,
        )
    }
}

/// Half-open pixel window. Indices may run outside the raster; callers
/// pad the overhang with no-data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelWindow {
    pub row0: isize,
    pub row1: isize,
    pub col0: isize,
    pub col1: isize,
}

impl PixelWindow {
    pub fn height(&self) -> usize {
        (self.row1 - self.row0).max(0) as usize
    }

    pub fn width(&self) -> usize {
        (self.col1 - self.col0).max(0) as usize
    }
}

/// Per-sensor chip geometry in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipWindows {
    pub chip_px: usize,
    pub sample_px: usize,
    /// Padding ring between the full chip and the sampling core.
    pub pad_px: usize,
}

/// Derive pixel sizes from the metric chip geometry at one sensor's
/// resolution. Fractions truncate, mirroring integer pixel counts.
pub fn chip_windows(chip_size_m: f64, sample_size_m: f64, resolution: f64) -> ChipWindows {
    let chip_px = (chip_size_m / resolution) as usize;
    let sample_px = (sample_size_m / resolution) as usize;
    let pad_px = (chip_px - sample_px) / 2;
    ChipWindows { chip_px, sample_px, pad_px }
}

/// Physical chip location: meters from the authoritative grid's
/// top-left corner to the top-left corner of the sampling core. The
/// same location maps onto every sensor's grid independently, so
/// sensors of different resolutions sample the same ground.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipLocation {
    pub off_x: f64,
    pub off_y: f64,
}

impl ChipLocation {
    /// Location of a land-cover block candidate.
    pub fn from_block(block_row: usize, block_col: usize, sample_size_m: f64) -> ChipLocation {
        ChipLocation {
            off_x: block_col as f64 * sample_size_m,
            off_y: block_row as f64 * sample_size_m,
        }
    }

    /// Pixel window of the padded chip on one sensor's grid.
    pub fn window(
        &self,
        auth: &Bounds,
        grid: &GridSpec,
        chip_size_m: f64,
        sample_size_m: f64,
    ) -> (PixelWindow, ChipWindows) {
        let cw = chip_windows(chip_size_m, sample_size_m, grid.resolution);
        let pad_m = (chip_size_m - sample_size_m) / 2.0;
        let x0 = auth.min_x + self.off_x - pad_m;
        let y1 = auth.max_y - self.off_y + pad_m;
        let col0 = ((x0 - grid.bounds.min_x) / grid.resolution).round() as isize;
        let row0 = ((grid.bounds.max_y - y1) / grid.resolution).round() as isize;
        (
            PixelWindow {
                row0,
                row1: row0 + cw.chip_px as isize,
                col0,
                col1: col0 + cw.chip_px as isize,
            },
            cw,
        )
    }

    /// Projected extent of the full chip, used for the footprint.
    pub fn chip_bounds(&self, auth: &Bounds, chip_size_m: f64, sample_size_m: f64) -> Bounds {
        let pad_m = (chip_size_m - sample_size_m) / 2.0;
        let min_x = auth.min_x + self.off_x - pad_m;
        let max_y = auth.max_y - self.off_y + pad_m;
        Bounds {
            min_x,
            min_y: max_y - chip_size_m,
            max_x: min_x + chip_size_m,
            max_y,
        }
    }
}
