use std::ops::Range;

use tracing::{debug, warn};

use crate::{
    concurrency::{ArrayBackend, ArrayOps},
    domain::Domain,
    particle_code::{ExcludedParticle, Special},
    particle_store::ParticleStore,
};

/// Marker stored in `dcell` for particles that have no cell.
pub const NO_CELL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Block {
    Boundary,
    Fluid,
}

/// Result of one division: per-cell index ranges into the sorted arrays.
///
/// Keys `[0, nct)` are boundary cells and `[nct, 2*nct)` fluid-block cells;
/// `begin_cell[k]..begin_cell[k + 1]` is the range of key `k`. The ranges
/// cover `[0, np)` exactly with the boundary block first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellPartition {
    nct: usize,
    begin_cell: Vec<u32>,
    pub np: usize,
    pub npb: usize,
    pub npb_out: usize,
    pub npf_out: usize,
    pub ignored: usize,
}

impl CellPartition {
    pub fn num_cells(&self) -> usize {
        self.nct
    }

    pub fn begin_cell(&self) -> &[u32] {
        &self.begin_cell
    }

    fn key_base(&self, block: Block) -> usize {
        match block {
            Block::Boundary => 0,
            Block::Fluid => self.nct,
        }
    }

    pub fn cell_range(&self, block: Block, cell: u32) -> Range<usize> {
        let k = self.key_base(block) + cell as usize;
        self.begin_cell[k] as usize..self.begin_cell[k + 1] as usize
    }

    pub fn block_range(&self, block: Block) -> Range<usize> {
        match block {
            Block::Boundary => 0..self.npb,
            Block::Fluid => self.npb..self.np,
        }
    }

    /// Calls `f` with the index ranges of `block` particles in the cells within
    /// `hdiv` cells of `cell`. Cells adjacent along x are merged into one range.
    pub fn for_each_neighbor_range(&self, domain: &Domain, cell: u32, block: Block, mut f: impl FnMut(Range<usize>)) {
        let c = domain.cell_coords(cell);
        let hdiv = domain.hdiv;
        let span = |v: u32, n: u32| (v.saturating_sub(hdiv), (v + hdiv).min(n - 1));
        let (x0, x1) = span(c.x, domain.ncells.x);
        let (y0, y1) = span(c.y, domain.ncells.y);
        let (z0, z1) = span(c.z, domain.ncells.z);
        let base = self.key_base(block);

        for z in z0..=z1 {
            for y in y0..=y1 {
                let first = base + domain.cell_index(&[x0, y, z].into()) as usize;
                let last = base + domain.cell_index(&[x1, y, z].into()) as usize;
                let range = self.begin_cell[first] as usize..self.begin_cell[last + 1] as usize;
                if !range.is_empty() {
                    f(range);
                }
            }
        }
    }
}

/// Particles removed by a division.
#[derive(Debug, Clone, Default)]
pub struct DivideOutcome {
    pub boundary_out: Vec<ExcludedParticle>,
    pub fluid_out: Vec<ExcludedParticle>,
}

/// Sorts particles by block and cell and keeps the resulting partition.
#[derive(Debug, Clone, Default)]
pub struct CellDivision {
    partition: Option<CellPartition>,
    divisions: u64,
}

impl CellDivision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self) -> Option<&CellPartition> {
        self.partition.as_ref()
    }

    pub fn num_divisions(&self) -> u64 {
        self.divisions
    }

    /// Drops the partition, e.g. after the particle arrays were reallocated.
    pub fn invalidate(&mut self) {
        self.partition = None;
    }

    /// Recomputes cells, reorders every particle array and rebuilds the cell
    /// ranges. Particles outside the map (including non-finite positions) are
    /// flagged `OutPos`; those and particles already flagged out are moved past
    /// `np` and reported. Retired halo copies, and copies that land off the
    /// map, are dropped silently.
    pub fn divide(&mut self, store: &mut ParticleStore, domain: &Domain, backend: &ArrayBackend) -> DivideOutcome {
        let np0 = store.np;
        let nct = domain.num_cells();
        let key_bound_out = 2 * nct as u32;
        let key_fluid_out = key_bound_out + 1;
        let key_ignored = key_bound_out + 2;

        let mut keys = vec![0u32; np0];
        {
            let arrays = &mut store.arrays;
            let pos = &arrays.pos;
            backend.for_each_mut3(
                &mut arrays.code[..np0],
                &mut arrays.dcell[..np0],
                &mut keys,
                |i, code, dcell, key| {
                    *dcell = NO_CELL;
                    if code.is_ignored() {
                        *key = key_ignored;
                        return;
                    }
                    let cell = if code.is_out() { None } else { domain.cell_of(&pos[i]) };
                    match cell {
                        Some(cell) => {
                            let idx = domain.cell_index(&cell);
                            *dcell = idx;
                            *key = if code.is_boundary() { idx } else { nct as u32 + idx };
                        }
                        None if code.is_periodic() => {
                            // a halo copy off the map is never a real exclusion
                            *code = code.with_special(Special::Ignore);
                            *key = key_ignored;
                        }
                        None => {
                            if !code.is_out() {
                                *code = code.with_special(Special::OutPos);
                            }
                            *key = if code.is_boundary() { key_bound_out } else { key_fluid_out };
                        }
                    }
                },
            );
        }

        let order = backend.sorted_order(&keys);
        store.arrays.gather(&order, backend);
        let sorted_keys: Vec<u32> = order.iter().map(|&i| keys[i]).collect();

        let mut begin_cell = vec![0u32; 2 * nct + 1];
        let mut npb_out = 0;
        let mut npf_out = 0;
        let mut ignored = 0;
        for &key in &sorted_keys {
            if key < key_bound_out {
                begin_cell[key as usize + 1] += 1;
            } else if key == key_bound_out {
                npb_out += 1;
            } else if key == key_fluid_out {
                npf_out += 1;
            } else {
                ignored += 1;
            }
        }
        for k in 1..begin_cell.len() {
            begin_cell[k] += begin_cell[k - 1];
        }
        let np = begin_cell[2 * nct] as usize;
        let npb = begin_cell[nct] as usize;

        let record = |i: usize| ExcludedParticle {
            id: store.arrays.idp[i],
            kind: store.arrays.code[i].kind(),
            reason: store.arrays.code[i].special(),
            pos: store.arrays.pos[i],
            velrhop: store.arrays.velrhop[i],
        };
        let outcome = DivideOutcome {
            boundary_out: (np..np + npb_out).map(record).collect(),
            fluid_out: (np + npb_out..np + npb_out + npf_out).map(record).collect(),
        };

        let count_periodic = |range: Range<usize>| {
            store.arrays.code[range].iter().filter(|c| c.is_periodic()).count()
        };
        let npb_per = count_periodic(0..npb);
        let npf_per = count_periodic(npb..np);

        store.np = np;
        store.npb = npb;
        store.npb_per = npb_per;
        store.npf_per = npf_per;

        if npf_out > 0 {
            warn!("{} fluid particle(s) excluded", npf_out);
        }
        debug!(
            "divide: np={} npb={} ghosts={}/{} out={}/{} ignored={}",
            np, npb, npb_per, npf_per, npb_out, npf_out, ignored
        );

        self.partition = Some(CellPartition {
            nct,
            begin_cell,
            np,
            npb,
            npb_out,
            npf_out,
            ignored,
        });
        self.divisions += 1;
        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        concurrency::{RayonBackend, SerialBackend},
        domain::tests::unit_box,
        floating_type_mod::FT,
        particle_code::{Code, ParticleKind},
        vec3d, V4, VD3,
    };

    pub(crate) fn store_from(particles: &[(ParticleKind, VD3)]) -> ParticleStore {
        let mut store = ParticleStore::new(particles.len() + 8, None).unwrap();
        for (i, (kind, pos)) in particles.iter().enumerate() {
            store.arrays.idp[i] = i as u32;
            store.arrays.code[i] = Code::new(*kind, 0);
            store.arrays.pos[i] = *pos;
            store.arrays.velrhop[i] = V4::new(0., 0., 0., 1000.);
        }
        store.np = particles.len();
        store
    }

    fn check_partition(store: &ParticleStore, domain: &Domain, partition: &CellPartition) {
        let nct = partition.num_cells();
        let begin = partition.begin_cell();
        assert_eq!(begin[0], 0);
        assert_eq!(begin[2 * nct] as usize, store.np);
        assert!(begin.windows(2).all(|w| w[0] <= w[1]));
        for block in [Block::Boundary, Block::Fluid] {
            for cell in 0..nct as u32 {
                for i in partition.cell_range(block, cell) {
                    assert_eq!(store.arrays.dcell[i], cell);
                    assert_eq!(store.arrays.code[i].is_boundary(), block == Block::Boundary);
                    let c = domain.cell_of(&store.arrays.pos[i]).unwrap();
                    assert_eq!(domain.cell_index(&c), cell);
                }
            }
        }
    }

    #[test]
    fn partition_groups_boundary_first() {
        let (domain, _) = unit_box(false, false);
        let mut store = store_from(&[
            (ParticleKind::Fluid, vec3d(0.55, 0.5, 0.5)),
            (ParticleKind::Fixed, vec3d(0.05, 0.05, 0.05)),
            (ParticleKind::Floating, vec3d(0.15, 0.5, 0.5)),
            (ParticleKind::Moving, vec3d(0.95, 0.95, 0.95)),
            (ParticleKind::Fluid, vec3d(0.51, 0.52, 0.53)),
        ]);
        let mut division = CellDivision::new();
        let outcome = division.divide(&mut store, &domain, &SerialBackend.into());
        assert!(outcome.boundary_out.is_empty() && outcome.fluid_out.is_empty());

        let partition = division.partition().unwrap();
        assert_eq!(store.np, 5);
        assert_eq!(store.npb, 2);
        assert_eq!(&store.arrays.idp[..5], &[1, 3, 2, 0, 4]);
        check_partition(&store, &domain, partition);
    }

    #[test]
    fn division_is_idempotent() {
        let (domain, _) = unit_box(false, false);
        let positions: Vec<(ParticleKind, VD3)> = (0..200)
            .map(|i| {
                let f = i as f64;
                let kind = if i % 5 == 0 { ParticleKind::Fixed } else { ParticleKind::Fluid };
                (kind, vec3d((f * 0.137) % 1., (f * 0.291) % 1., (f * 0.443) % 1.))
            })
            .collect();
        let mut store = store_from(&positions);
        let mut division = CellDivision::new();
        let backend: ArrayBackend = RayonBackend.into();
        division.divide(&mut store, &domain, &backend);
        let first_ids = store.arrays.idp[..store.np].to_vec();
        let first_partition = division.partition().unwrap().clone();

        division.divide(&mut store, &domain, &backend);
        assert_eq!(&store.arrays.idp[..store.np], first_ids.as_slice());
        assert_eq!(division.partition().unwrap(), &first_partition);
        check_partition(&store, &domain, &first_partition);
    }

    #[test]
    fn non_finite_and_outside_positions_are_excluded() {
        let (domain, _) = unit_box(false, false);
        let mut store = store_from(&[
            (ParticleKind::Fluid, vec3d(f64::NAN, 0.5, 0.5)),
            (ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5)),
            (ParticleKind::Fluid, vec3d(2.0, 0.5, 0.5)),
        ]);
        let mut division = CellDivision::new();
        let outcome = division.divide(&mut store, &domain, &SerialBackend.into());
        assert_eq!(store.np, 1);
        assert_eq!(store.arrays.idp[0], 1);
        assert_eq!(outcome.fluid_out.len(), 2);
        assert!(outcome.fluid_out.iter().all(|p| p.reason == Special::OutPos));
        let mut ids: Vec<u32> = outcome.fluid_out.iter().map(|p| p.id).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn boundary_exclusion_and_flagged_particles_are_reported() {
        let (domain, _) = unit_box(false, false);
        let mut store = store_from(&[
            (ParticleKind::Fixed, vec3d(-0.5, 0.5, 0.5)),
            (ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5)),
            (ParticleKind::Fluid, vec3d(0.6, 0.5, 0.5)),
            (ParticleKind::Fluid, vec3d(0.7, 0.5, 0.5)),
        ]);
        store.arrays.code[2] = store.arrays.code[2].with_special(Special::OutRhop);
        store.arrays.code[3] = store.arrays.code[3].with_special(Special::Ignore);

        let mut division = CellDivision::new();
        let outcome = division.divide(&mut store, &domain, &SerialBackend.into());
        assert_eq!(outcome.boundary_out.len(), 1);
        assert_eq!(outcome.boundary_out[0].id, 0);
        assert_eq!(outcome.fluid_out.len(), 1);
        assert_eq!(outcome.fluid_out[0].reason, Special::OutRhop);
        assert_eq!(store.np, 1);
        assert_eq!(division.partition().unwrap().ignored, 1);
    }

    #[test]
    fn neighbor_ranges_contain_all_close_particles() {
        let (domain, constants) = unit_box(false, false);
        let positions: Vec<(ParticleKind, VD3)> = (0..300)
            .map(|i| {
                let f = i as f64;
                (ParticleKind::Fluid, vec3d((f * 0.619) % 1., (f * 0.347) % 1., (f * 0.871) % 1.))
            })
            .collect();
        let mut store = store_from(&positions);
        let mut division = CellDivision::new();
        division.divide(&mut store, &domain, &SerialBackend.into());
        let partition = division.partition().unwrap();

        for i in 0..store.np {
            let mut found = Vec::new();
            partition.for_each_neighbor_range(&domain, store.arrays.dcell[i], Block::Fluid, |r| found.extend(r));
            for j in 0..store.np {
                let d = (store.arrays.pos[i] - store.arrays.pos[j]).norm();
                if d < constants.dosh {
                    assert!(found.contains(&j), "missing neighbor {} of {} at distance {}", j, i, d as FT);
                }
            }
        }
    }
}
