//! Version matrix enumeration and static port assignment.
//!
//! Each backup tool variant is crossed with every supported Prometheus
//! release. Ports are a pure function of the cell's position: every variant
//! owns a disjoint base range, and within a variant each cell offsets the
//! bases by its flattened enumeration index. Two cells can therefore never
//! claim the same host port, so concurrently executing scenarios need no
//! shared allocator or runtime coordination.

use crate::producer::BackupTool;
use crate::scenario::Scenario;

/// restic releases the harness validates against.
pub const RESTIC_VERSIONS: [&str; 3] = ["0.17.0", "0.18.0", "0.18.1"];

/// rustic releases the harness validates against.
pub const RUSTIC_VERSIONS: [&str; 3] = ["v0.9.5", "v0.10.0", "v0.10.1"];

/// Prometheus releases the harness validates against.
pub const PROMETHEUS_VERSIONS: [&str; 7] = [
    "v3.2.0", "v3.3.0", "v3.4.0", "v3.5.0", "v3.6.0", "v3.7.0", "v3.8.0",
];

/// Exporter and Prometheus port bases per variant. Each range is far wider
/// than a variant's cell count, so flattened offsets never cross into
/// another range.
const fn port_bases(tool: BackupTool) -> (u16, u16) {
    match tool {
        BackupTool::Restic => (1100, 1200),
        BackupTool::Rustic => (1300, 1400),
    }
}

/// Tool releases for one variant.
#[must_use]
pub const fn tool_versions(tool: BackupTool) -> &'static [&'static str] {
    match tool {
        BackupTool::Restic => &RESTIC_VERSIONS,
        BackupTool::Rustic => &RUSTIC_VERSIONS,
    }
}

/// One cell of the version matrix with its statically assigned ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixCell {
    tool: BackupTool,
    tool_tag: &'static str,
    prometheus_tag: &'static str,
    exporter_port: u16,
    prometheus_port: u16,
}

impl MatrixCell {
    /// Backup tool variant of this cell.
    #[must_use]
    pub const fn tool(&self) -> BackupTool {
        self.tool
    }

    /// Backup tool release of this cell.
    #[must_use]
    pub const fn tool_tag(&self) -> &'static str {
        self.tool_tag
    }

    /// Prometheus release of this cell.
    #[must_use]
    pub const fn prometheus_tag(&self) -> &'static str {
        self.prometheus_tag
    }

    /// Host port assigned to the exporter for this cell.
    #[must_use]
    pub const fn exporter_port(&self) -> u16 {
        self.exporter_port
    }

    /// Host port assigned to Prometheus for this cell.
    #[must_use]
    pub const fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    /// Builds the ready-to-run scenario for this cell.
    #[must_use]
    pub fn scenario(&self) -> Scenario {
        Scenario::new(
            self.tool,
            self.tool_tag,
            self.prometheus_tag,
            self.exporter_port,
            self.prometheus_port,
        )
    }
}

/// Enumerates the full matrix for one variant in a stable order.
#[must_use]
pub fn cells(tool: BackupTool) -> Vec<MatrixCell> {
    let (exporter_base, prometheus_base) = port_bases(tool);
    let mut enumerated = Vec::new();
    let mut flat_index: u16 = 0;
    for tool_tag in tool_versions(tool).iter().copied() {
        for prometheus_tag in PROMETHEUS_VERSIONS {
            enumerated.push(MatrixCell {
                tool,
                tool_tag,
                prometheus_tag,
                exporter_port: exporter_base + flat_index,
                prometheus_port: prometheus_base + flat_index,
            });
            flat_index += 1;
        }
    }
    enumerated
}

/// Looks up the cell for an exact version combination.
#[must_use]
pub fn cell_for(tool: BackupTool, tool_tag: &str, prometheus_tag: &str) -> Option<MatrixCell> {
    cells(tool)
        .into_iter()
        .find(|cell| cell.tool_tag == tool_tag && cell.prometheus_tag == prometheus_tag)
}

#[cfg(test)]
mod tests {
    #![expect(
        clippy::expect_used,
        reason = "test code uses expect for clarity and assertions"
    )]

    use std::collections::HashSet;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::restic(BackupTool::Restic)]
    #[case::rustic(BackupTool::Rustic)]
    fn matrix_covers_the_cartesian_product(#[case] tool: BackupTool) {
        let enumerated = cells(tool);
        assert_eq!(
            enumerated.len(),
            tool_versions(tool).len() * PROMETHEUS_VERSIONS.len()
        );

        let combinations: HashSet<(&str, &str)> = enumerated
            .iter()
            .map(|cell| (cell.tool_tag(), cell.prometheus_tag()))
            .collect();
        assert_eq!(combinations.len(), enumerated.len(), "no duplicate cells");
    }

    #[test]
    fn ports_are_pairwise_disjoint_across_the_full_matrix() {
        let mut all_cells = cells(BackupTool::Restic);
        all_cells.extend(cells(BackupTool::Rustic));

        let mut claimed: HashSet<u16> = HashSet::new();
        for cell in &all_cells {
            assert_ne!(cell.exporter_port(), cell.prometheus_port());
            assert!(
                claimed.insert(cell.exporter_port()),
                "exporter port {} claimed twice",
                cell.exporter_port()
            );
            assert!(
                claimed.insert(cell.prometheus_port()),
                "prometheus port {} claimed twice",
                cell.prometheus_port()
            );
        }
        assert_eq!(claimed.len(), all_cells.len() * 2);
    }

    #[rstest]
    #[case::restic(BackupTool::Restic, 1100, 1200)]
    #[case::rustic(BackupTool::Rustic, 1300, 1400)]
    fn ports_stay_inside_the_variant_base_ranges(
        #[case] tool: BackupTool,
        #[case] exporter_base: u16,
        #[case] prometheus_base: u16,
    ) {
        for cell in cells(tool) {
            assert!(cell.exporter_port() >= exporter_base);
            assert!(cell.exporter_port() < exporter_base + 100);
            assert!(cell.prometheus_port() >= prometheus_base);
            assert!(cell.prometheus_port() < prometheus_base + 100);
        }
    }

    #[test]
    fn cell_lookup_finds_an_exact_combination() {
        let cell = cell_for(BackupTool::Rustic, "v0.10.0", "v3.4.0")
            .expect("combination is in the matrix");
        // Flattened index 1 * 7 + 2 = 9 on the rustic bases.
        assert_eq!(cell.exporter_port(), 1309);
        assert_eq!(cell.prometheus_port(), 1409);
    }

    #[test]
    fn unknown_combinations_are_not_invented() {
        assert!(cell_for(BackupTool::Restic, "9.9.9", "v3.4.0").is_none());
    }
}
