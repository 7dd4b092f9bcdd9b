use tracing::{debug, trace};

use crate::{
    concurrency::{ArrayBackend, ArrayOps},
    domain::{Domain, PeriodicAxis},
    error::Result,
    particle_code::Special,
    particle_store::ParticleStore,
    simulation_parameters::PERIODIC_OVER_FRACTION,
};

/// Totals of one replication pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodicStats {
    pub boundary_ghosts: usize,
    pub fluid_ghosts: usize,
    pub resizes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    /// Ghosts created earlier in this pass for the same block.
    NewGhosts,
    Originals,
}

/// Creates the halo copies near periodic faces and retires the previous ones.
#[derive(Debug, Clone, Default)]
pub struct PeriodicReplicator {
    passes: u64,
}

impl PeriodicReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_passes(&self) -> u64 {
        self.passes
    }

    /// Flags every existing halo copy as ignored. They are removed by the next division.
    pub fn mark_ignored(store: &mut ParticleStore, backend: &ArrayBackend) {
        let np = store.np;
        backend.for_each_mut1(&mut store.arrays.code[..np], |_, code| {
            if code.is_periodic() {
                *code = code.with_special(Special::Ignore);
            }
        });
    }

    /// Marks the old halo, then duplicates every valid particle lying within
    /// one kernel support of a periodic face. New copies are appended at `np`,
    /// boundary copies before fluid copies. For each block and axis the copies
    /// made earlier in this pass are scanned first so that edge and corner
    /// images are produced when several axes are periodic.
    pub fn run(&mut self, store: &mut ParticleStore, domain: &Domain, backend: &ArrayBackend) -> Result<PeriodicStats> {
        // checked before anything is written
        let symplectic = store.has_symplectic_buffers()?;

        Self::mark_ignored(store, backend);

        let npb0 = store.npb;
        let npf0 = store.np - store.npb;
        let mut stats = PeriodicStats::default();

        for boundary_block in [true, false] {
            let (pini, num) = if boundary_block { (0, npb0) } else { (npb0, npf0) };
            for axis in &domain.periodic {
                for pool in [Pool::NewGhosts, Pool::Originals] {
                    let nper = if boundary_block {
                        stats.boundary_ghosts
                    } else {
                        stats.fluid_ghosts
                    };
                    let (start, count) = match pool {
                        Pool::NewGhosts => (store.np - nper, nper),
                        Pool::Originals => (pini, num),
                    };
                    if count == 0 {
                        continue;
                    }

                    let created = loop {
                        let list = Self::make_list(store, domain, axis, start, count, backend);
                        if store.np + list.len() > store.capacity() {
                            store.resize(store.np + list.len(), PERIODIC_OVER_FRACTION)?;
                            stats.resizes += 1;
                            continue;
                        }
                        Self::duplicate(store, &list, axis, symplectic);
                        break list.len();
                    };

                    trace!(
                        "periodic axis {} {:?} ({}): {} copies",
                        axis.axis,
                        pool,
                        if boundary_block { "boundary" } else { "fluid" },
                        created
                    );
                    if boundary_block {
                        stats.boundary_ghosts += created;
                    } else {
                        stats.fluid_ghosts += created;
                    }
                }
            }
        }

        self.passes += 1;
        debug!(
            "periodic pass {}: {} boundary and {} fluid copies",
            self.passes, stats.boundary_ghosts, stats.fluid_ghosts
        );
        Ok(stats)
    }

    /// Source index and image direction (+1 lower face, -1 upper face) of every
    /// particle in `start..start + count` that needs a copy across `axis`.
    fn make_list(
        store: &ParticleStore,
        domain: &Domain,
        axis: &PeriodicAxis,
        start: usize,
        count: usize,
        backend: &ArrayBackend,
    ) -> Vec<(usize, f64)> {
        let a = axis.axis;
        let lower = domain.real_min[a];
        let upper = domain.real_max[a];
        let dosh = domain.dosh;
        let code = &store.arrays.code;
        let pos = &store.arrays.pos;

        backend
            .map_collect(count, |k| {
                let i = start + k;
                if !code[i].is_valid() {
                    return None;
                }
                let x = pos[i][a];
                if x - lower < dosh {
                    Some((i, 1.))
                } else if upper - x <= dosh {
                    Some((i, -1.))
                } else {
                    None
                }
            })
            .into_iter()
            .flatten()
            .collect()
    }

    fn duplicate(store: &mut ParticleStore, list: &[(usize, f64)], axis: &PeriodicAxis, symplectic: bool) {
        for &(src, sign) in list {
            let dst = store.np;
            store.arrays.copy_particle(src, dst);
            let offset = axis.inc * sign;
            store.arrays.pos[dst] += offset;
            if symplectic {
                if let Some(pos_pre) = &mut store.arrays.pos_pre {
                    pos_pre[dst] += offset;
                }
            }
            store.arrays.code[dst] = store.arrays.code[src].with_special(Special::Periodic);
            store.np += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cell_division::{tests::store_from, CellDivision},
        concurrency::SerialBackend,
        domain::tests::unit_box,
        domain::PeriodicAxis,
        error::SimulationError,
        particle_code::ParticleKind,
        particle_store::AuxArray,
        vec3d, V4,
    };

    fn backend() -> ArrayBackend {
        SerialBackend.into()
    }

    #[test]
    fn ghost_appears_at_offset_and_is_retired_next_pass() {
        let (domain, _) = unit_box(true, false);
        let mut store = store_from(&[
            (ParticleKind::Fluid, vec3d(0.95, 0.5, 0.5)),
            (ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5)),
        ]);
        let mut division = CellDivision::new();
        division.divide(&mut store, &domain, &backend());

        let mut replicator = PeriodicReplicator::new();
        let stats = replicator.run(&mut store, &domain, &backend()).unwrap();
        assert_eq!(stats.fluid_ghosts, 1);
        assert_eq!(store.np, 3);
        let ghost = 2;
        assert!(store.arrays.code[ghost].is_periodic());
        assert_eq!(store.arrays.idp[ghost], 0);
        assert!((store.arrays.pos[ghost].x - (0.95 - 1.0)).abs() < 1e-12);

        division.divide(&mut store, &domain, &backend());
        assert_eq!(store.npf_per, 1);

        PeriodicReplicator::mark_ignored(&mut store, &backend());
        assert!(store.arrays.code[..store.np].iter().all(|c| !c.is_periodic()));
        division.divide(&mut store, &domain, &backend());
        assert_eq!(store.np, 2);
        assert_eq!(store.npf_per, 0);
    }

    #[test]
    fn second_pass_replaces_the_halo() {
        let (domain, _) = unit_box(true, false);
        let mut store = store_from(&[
            (ParticleKind::Fixed, vec3d(0.02, 0.5, 0.5)),
            (ParticleKind::Fluid, vec3d(0.99, 0.5, 0.5)),
        ]);
        let mut division = CellDivision::new();
        let mut replicator = PeriodicReplicator::new();
        for _ in 0..3 {
            replicator.run(&mut store, &domain, &backend()).unwrap();
            division.divide(&mut store, &domain, &backend());
            assert_eq!(store.np, 4);
            assert_eq!(store.npb, 2);
            assert_eq!((store.npb_per, store.npf_per), (1, 1));
        }
        let boundary_ghost = (0..store.npb).find(|&i| store.arrays.code[i].is_periodic()).unwrap();
        assert!((store.arrays.pos[boundary_ghost].x - 1.02).abs() < 1e-12);
    }

    #[test]
    fn capacity_shortfall_resizes_without_duplicates() {
        let (domain, _) = unit_box(true, false);
        let particles: Vec<_> = (0..20)
            .map(|i| (ParticleKind::Fluid, vec3d(0.01, 0.05 * i as f64, 0.5)))
            .collect();
        let mut store = store_from(&particles);
        store.resize(20, 0.).unwrap();
        assert_eq!(store.capacity(), 20);

        let stats = PeriodicReplicator::new().run(&mut store, &domain, &backend()).unwrap();
        assert_eq!(stats.fluid_ghosts, 20);
        assert_eq!(stats.resizes, 1);
        assert_eq!(store.np, 40);
        assert!(store.capacity() >= 40);
        let mut ghost_ids: Vec<u32> = store.arrays.idp[20..40].to_vec();
        ghost_ids.sort();
        assert_eq!(ghost_ids, (0..20).collect::<Vec<u32>>());
    }

    #[test]
    fn capacity_ceiling_stops_the_retry() {
        let (domain, _) = unit_box(true, false);
        let mut store = ParticleStore::new(4, Some(5)).unwrap();
        for i in 0..4 {
            store.arrays.idp[i] = i as u32;
            store.arrays.code[i] = crate::particle_code::Code::new(ParticleKind::Fluid, 0);
            store.arrays.pos[i] = vec3d(0.01, 0.2 * i as f64, 0.5);
        }
        store.np = 4;
        let err = PeriodicReplicator::new().run(&mut store, &domain, &backend()).unwrap_err();
        assert!(matches!(err, SimulationError::CapacityExhausted { requested: 8, ceiling: 5 }));
        assert_eq!(store.np, 4);
    }

    #[test]
    fn two_periodic_axes_produce_corner_images() {
        let (mut domain, _) = unit_box(true, false);
        domain.periodic.push(PeriodicAxis {
            axis: 1,
            inc: vec3d(0., 1., 0.),
        });
        let mut store = store_from(&[(ParticleKind::Fluid, vec3d(0.02, 0.03, 0.5))]);
        let stats = PeriodicReplicator::new().run(&mut store, &domain, &backend()).unwrap();
        assert_eq!(stats.fluid_ghosts, 3);
        let mut images: Vec<(i64, i64)> = store.arrays.pos[1..4]
            .iter()
            .map(|p| ((p.x * 100.).round() as i64, (p.y * 100.).round() as i64))
            .collect();
        images.sort();
        assert_eq!(images, vec![(2, 103), (102, 3), (102, 103)]);
    }

    #[test]
    fn verlet_history_and_symplectic_state_are_copied() {
        let (domain, _) = unit_box(true, false);
        let mut store = store_from(&[(ParticleKind::Fluid, vec3d(0.98, 0.5, 0.5))]);
        store.allocate(AuxArray::PosPre).unwrap();
        store.allocate(AuxArray::VelrhopPre).unwrap();
        store.allocate(AuxArray::VelrhopM1).unwrap();
        store.arrays.velrhop_m1.as_mut().unwrap()[0] = V4::new(0., 0., 2., 1001.);
        store.arrays.pos_pre.as_mut().unwrap()[0] = vec3d(0.97, 0.5, 0.5);
        store.arrays.velrhop_pre.as_mut().unwrap()[0] = V4::new(1., 0., 0., 999.);

        PeriodicReplicator::new().run(&mut store, &domain, &backend()).unwrap();
        let pos_pre = store.arrays.pos_pre.as_ref().unwrap();
        assert!((pos_pre[1].x - (0.97 - 1.)).abs() < 1e-12);
        assert_eq!(store.arrays.velrhop_pre.as_ref().unwrap()[1], V4::new(1., 0., 0., 999.));
        assert_eq!(store.arrays.velrhop_m1.as_ref().unwrap()[1], V4::new(0., 0., 2., 1001.));

        store.free(AuxArray::VelrhopPre);
        assert!(matches!(
            PeriodicReplicator::new().run(&mut store, &domain, &backend()),
            Err(SimulationError::InvalidSymplecticState)
        ));
    }
}
