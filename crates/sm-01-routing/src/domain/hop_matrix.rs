//! Per-switch minimum-hop matrix.
//!
//! Row `lid`, column `port` holds the hop count to `lid` when leaving through
//! `port`. Column 0 holds the switch-wide minimum for the row, so a value of
//! 0 there means the LID belongs to the switch itself.
//!
//! ```text
//!            port 0 (min)   port 1   port 2   ...
//! lid 1          2             2       0xFF
//! lid 2          0            0xFF     0xFF        <- local LID
//! lid 3          1            0xFF      1
//! ```

use fabric_types::{Lid, PortNum};

use super::errors::{RoutingError, RoutingResult};

/// Hop count meaning "unreachable".
pub const HOP_NO_PATH: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopMatrix {
    /// Columns per row (`num_ports + 1`).
    columns: usize,
    /// Highest LID covered. Never shrinks.
    max_lid: u16,
    cells: Vec<u8>,
}

impl HopMatrix {
    pub fn new(num_ports: PortNum) -> Self {
        Self {
            columns: num_ports as usize + 1,
            max_lid: 0,
            cells: Vec::new(),
        }
    }

    /// Highest LID the matrix covers.
    pub fn max_lid(&self) -> u16 {
        self.max_lid
    }

    /// Highest port number the matrix covers.
    pub fn num_ports(&self) -> PortNum {
        (self.columns - 1) as PortNum
    }

    /// Resize to cover `max_lid` and reset every entry to `HOP_NO_PATH`.
    ///
    /// The covered range grows monotonically: asking for a smaller bound than
    /// a previous sweep keeps the larger one.
    pub fn prepare_rebuild(&mut self, max_lid: u16) -> RoutingResult<()> {
        let bound = self.max_lid.max(max_lid);
        let needed = (bound as usize + 1) * self.columns;

        if needed > self.cells.len() {
            self.cells
                .try_reserve_exact(needed - self.cells.len())
                .map_err(|_| RoutingError::InsufficientResources {
                    what: "hop matrix",
                    requested: needed,
                })?;
        }

        self.cells.clear();
        self.cells.resize(needed, HOP_NO_PATH);
        self.max_lid = bound;
        Ok(())
    }

    /// Record that `port` reaches `lid` in `hops`, lowering the row minimum
    /// when `hops` is smaller.
    pub fn set_hop(&mut self, lid: Lid, port: PortNum, hops: u8) -> RoutingResult<()> {
        let row = self.row_index(lid)?;
        let col = port as usize;
        if col >= self.columns {
            return Err(RoutingError::InvalidParameter(format!(
                "port {} beyond hop matrix width {}",
                port,
                self.columns - 1
            )));
        }

        self.cells[row + col] = hops;
        if hops < self.cells[row] {
            self.cells[row] = hops;
        }
        Ok(())
    }

    /// Hops to `lid` through `port`, or `HOP_NO_PATH` when unknown.
    pub fn hops(&self, lid: Lid, port: PortNum) -> u8 {
        match self.row_index(lid) {
            Ok(row) if (port as usize) < self.columns => self.cells[row + port as usize],
            _ => HOP_NO_PATH,
        }
    }

    /// Minimum hops to `lid` over all ports, or `HOP_NO_PATH`.
    pub fn least_hops(&self, lid: Lid) -> u8 {
        self.hops(lid, 0)
    }

    /// Full row for `lid`, column 0 first.
    pub fn row(&self, lid: Lid) -> Option<&[u8]> {
        let row = self.row_index(lid).ok()?;
        Some(&self.cells[row..row + self.columns])
    }

    fn row_index(&self, lid: Lid) -> RoutingResult<usize> {
        let raw = lid.raw();
        if raw == 0 || raw > self.max_lid || self.cells.is_empty() {
            return Err(RoutingError::InvalidParameter(format!(
                "lid {} outside hop matrix bound {}",
                lid, self.max_lid
            )));
        }
        Ok(raw as usize * self.columns)
    }
}
