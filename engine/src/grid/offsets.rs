//! Pure coordinate transforms between grid positions and pixel offsets

use crate::config::GridConfig;
use crate::experiment::{GridDims, Offset, PixelSize};

/// Length of `count` items of `item` pixels separated by `gap` pixels
pub fn extent(count: u64, item: u64, gap: u64) -> u64 {
    if count == 0 {
        0
    } else {
        count * item + (count - 1) * gap
    }
}

/// Offset of a site's top-left corner, given its well's offset
pub fn site_offset(row: u32, col: u32, site: PixelSize, grid: &GridConfig, well: Offset) -> Offset {
    let row = row as u64;
    let col = col as u64;
    Offset {
        y: row * site.height + row * grid.vertical_site_displacement as u64 + well.y,
        x: col * site.width + col * grid.horizontal_site_displacement as u64 + well.x,
    }
}

/// Pixel size of a well holding a full site grid
pub fn well_size(site_grid: GridDims, site: PixelSize, grid: &GridConfig) -> PixelSize {
    PixelSize {
        height: extent(
            site_grid.rows as u64,
            site.height,
            grid.vertical_site_displacement as u64,
        ),
        width: extent(
            site_grid.cols as u64,
            site.width,
            grid.horizontal_site_displacement as u64,
        ),
    }
}

/// Position of `value` among the sorted non-empty rows or columns.
///
/// Empty rows/columns take no slot, so a sparse plate is laid out compactly.
pub fn slot_index(value: u32, nonempty: &[u32]) -> Option<u64> {
    nonempty.binary_search(&value).ok().map(|i| i as u64)
}

/// Offset of a well's top-left corner within the global space
pub fn well_offset(
    row_slot: u64,
    col_slot: u64,
    well: PixelSize,
    spacer: u64,
    plate: Offset,
) -> Offset {
    Offset {
        y: row_slot * (well.height + spacer) + plate.y,
        x: col_slot * (well.width + spacer) + plate.x,
    }
}

/// Pixel size of a plate with the given numbers of non-empty well rows/columns
pub fn plate_size(nonempty_rows: usize, nonempty_cols: usize, well: PixelSize, spacer: u64) -> PixelSize {
    PixelSize {
        height: extent(nonempty_rows as u64, well.height, spacer),
        width: extent(nonempty_cols as u64, well.width, spacer),
    }
}

/// Grid the plates of an experiment are arranged in: `ceil(sqrt(n))` columns
pub fn plate_grid_dims(plate_count: usize) -> GridDims {
    if plate_count == 0 {
        return GridDims::new(0, 0);
    }
    let mut cols = (plate_count as f64).sqrt().ceil() as usize;
    // Guard against float rounding on perfect squares
    while cols * cols < plate_count {
        cols += 1;
    }
    let rows = plate_count.div_ceil(cols);
    GridDims::new(rows as u32, cols as u32)
}

/// Offset of the `index`-th plate (row-major) in the plate grid
pub fn plate_offset(index: usize, plate_grid: GridDims, plate: PixelSize, spacer: u64) -> Offset {
    let cols = plate_grid.cols.max(1) as u64;
    let row = index as u64 / cols;
    let col = index as u64 % cols;
    Offset {
        y: row * (plate.height + spacer),
        x: col * (plate.width + spacer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(vertical: u32, horizontal: u32) -> GridConfig {
        GridConfig {
            vertical_site_displacement: vertical,
            horizontal_site_displacement: horizontal,
            ..GridConfig::default()
        }
    }

    #[test]
    fn test_site_offset_without_displacement() {
        let offset = site_offset(
            1,
            2,
            PixelSize::new(512, 640),
            &grid(0, 0),
            Offset::new(1000, 2000),
        );
        assert_eq!(offset, Offset::new(1512, 3280));
    }

    #[test]
    fn test_site_offset_with_displacement() {
        let offset = site_offset(2, 3, PixelSize::new(100, 100), &grid(5, 7), Offset::new(0, 0));
        assert_eq!(offset, Offset::new(210, 321));
    }

    #[test]
    fn test_extent() {
        assert_eq!(extent(0, 100, 10), 0);
        assert_eq!(extent(1, 100, 10), 100);
        assert_eq!(extent(3, 100, 10), 320);
    }

    #[test]
    fn test_slot_index_skips_empty_rows() {
        let rows = [0, 2, 5];
        assert_eq!(slot_index(0, &rows), Some(0));
        assert_eq!(slot_index(2, &rows), Some(1));
        assert_eq!(slot_index(5, &rows), Some(2));
        assert_eq!(slot_index(3, &rows), None);
    }

    #[test]
    fn test_plate_grid_dims() {
        assert_eq!(plate_grid_dims(1), GridDims::new(1, 1));
        assert_eq!(plate_grid_dims(2), GridDims::new(1, 2));
        assert_eq!(plate_grid_dims(4), GridDims::new(2, 2));
        assert_eq!(plate_grid_dims(5), GridDims::new(2, 3));
        assert_eq!(plate_grid_dims(9), GridDims::new(3, 3));
        assert_eq!(plate_grid_dims(10), GridDims::new(3, 4));
    }

    #[test]
    fn test_plate_offset_row_major() {
        let dims = plate_grid_dims(3);
        let plate = PixelSize::new(1000, 2000);
        assert_eq!(plate_offset(0, dims, plate, 100), Offset::new(0, 0));
        assert_eq!(plate_offset(1, dims, plate, 100), Offset::new(0, 2100));
        assert_eq!(plate_offset(2, dims, plate, 100), Offset::new(1100, 0));
    }
}
