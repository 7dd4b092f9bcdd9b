use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

use sph_engine::{
    cell_division::{Block, CellDivision},
    concurrency::{ArrayBackend, ArrayBackendKind},
    domain::Domain,
    particle_code::{Code, ParticleKind},
    particle_store::{ParticleInit, ParticleStore},
    periodic::PeriodicReplicator,
    simulation_parameters::{Constants, SimulationParams},
    V4, VD3,
};

fn setup(periodic_x: bool) -> (Domain, Constants) {
    let mut params: SimulationParams = serde_yaml::from_str(
        r#"
step_algorithm: Symplectic
time_max: 1.0
time_out: 0.1
cfl_number: 0.2
speed_sound: 20.0
h: 0.05
domain:
  min: [0.0, 0.0, 0.0]
  max: [1.0, 1.0, 1.0]
"#,
    )
    .unwrap();
    params.periodic.x = periodic_x;
    let constants = params.constants(0.02).unwrap();
    let domain = Domain::new(&params, &constants, &[]).unwrap();
    (domain, constants)
}

fn cloud(seed: u64, nbound: usize, nfluid: usize) -> Vec<ParticleInit> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..nbound + nfluid)
        .map(|i| {
            let kind = if i < nbound {
                if rng.gen_bool(0.5) {
                    ParticleKind::Fixed
                } else {
                    ParticleKind::Moving
                }
            } else {
                ParticleKind::Fluid
            };
            ParticleInit {
                id: i as u32,
                code: Code::new(kind, 0),
                pos: VD3::new(rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)),
                velrhop: V4::new(0., 0., 0., 1000.),
            }
        })
        .collect()
}

fn divided(particles: &[ParticleInit], domain: &Domain, backend: ArrayBackend) -> (ParticleStore, CellDivision) {
    let mut store = ParticleStore::from_particles(particles, 0.5, None).unwrap();
    let mut division = CellDivision::new();
    let outcome = division.divide(&mut store, domain, &backend);
    assert!(outcome.boundary_out.is_empty());
    assert!(outcome.fluid_out.is_empty());
    (store, division)
}

proptest! {
    #[test]
    fn partition_covers_every_particle_once(seed in any::<u64>(), nbound in 0usize..40, nfluid in 0usize..200) {
        let (domain, _) = setup(false);
        let particles = cloud(seed, nbound, nfluid);
        let (store, division) = divided(&particles, &domain, ArrayBackendKind::Serial.into());
        let partition = division.partition().unwrap();

        prop_assert_eq!(store.np, nbound + nfluid);
        prop_assert_eq!(store.npb, nbound);
        let nct = domain.num_cells();
        let begin = partition.begin_cell();
        prop_assert_eq!(begin[0], 0);
        prop_assert_eq!(begin[2 * nct] as usize, store.np);
        prop_assert!(begin.windows(2).all(|w| w[0] <= w[1]));

        let mut seen = vec![0u32; store.np];
        for (block, range) in [(Block::Boundary, 0..store.npb), (Block::Fluid, store.npb..store.np)] {
            prop_assert_eq!(partition.block_range(block), range.clone());
            for cell in 0..nct as u32 {
                for i in partition.cell_range(block, cell) {
                    seen[i] += 1;
                    prop_assert_eq!(store.arrays.code[i].is_boundary(), block == Block::Boundary);
                    let expected = domain.cell_of(&store.arrays.pos[i]).map(|c| domain.cell_index(&c));
                    prop_assert_eq!(expected, Some(cell));
                }
            }
        }
        prop_assert!(seen.iter().all(|&n| n == 1));

        let mut ids: Vec<u32> = store.arrays.idp[..store.np].to_vec();
        ids.sort_unstable();
        prop_assert!(ids.iter().enumerate().all(|(i, &id)| id == i as u32));
    }

    #[test]
    fn dividing_again_changes_nothing(seed in any::<u64>(), nfluid in 1usize..150) {
        let (domain, _) = setup(false);
        let (mut store, mut division) = divided(&cloud(seed, 10, nfluid), &domain, ArrayBackendKind::Serial.into());
        let order: Vec<u32> = store.arrays.idp[..store.np].to_vec();
        let first = division.partition().cloned();

        division.divide(&mut store, &domain, &ArrayBackendKind::Serial.into());
        prop_assert_eq!(&store.arrays.idp[..store.np], &order[..]);
        prop_assert_eq!(division.partition().cloned(), first);
    }

    #[test]
    fn backends_produce_the_same_order(seed in any::<u64>(), nfluid in 1usize..300) {
        let (domain, _) = setup(false);
        let particles = cloud(seed, 20, nfluid);
        let (serial, _) = divided(&particles, &domain, ArrayBackendKind::Serial.into());
        let (rayon, _) = divided(&particles, &domain, ArrayBackendKind::Rayon.into());
        prop_assert_eq!(&serial.arrays.idp[..serial.np], &rayon.arrays.idp[..rayon.np]);
    }

    #[test]
    fn no_halo_copy_survives_the_next_pass(seed in any::<u64>(), nfluid in 1usize..150) {
        let (domain, _) = setup(true);
        let backend: ArrayBackend = ArrayBackendKind::Serial.into();
        let mut store = ParticleStore::from_particles(&cloud(seed, 5, nfluid), 0., None).unwrap();
        let mut division = CellDivision::new();
        let mut periodic = PeriodicReplicator::new();
        let nreal = store.np;

        for _ in 0..3 {
            let stats = periodic.run(&mut store, &domain, &backend).unwrap();
            let copies = stats.boundary_ghosts + stats.fluid_ghosts;
            division.divide(&mut store, &domain, &backend);
            prop_assert_eq!(store.np, nreal + copies);

            let mut ghosts = 0;
            for i in 0..store.np {
                let code = store.arrays.code[i];
                prop_assert!(!code.is_ignored());
                if !code.is_periodic() {
                    continue;
                }
                ghosts += 1;
                // every copy sits exactly one lattice increment away from its source
                let id = store.arrays.idp[i];
                let source = (0..store.np)
                    .find(|&j| store.arrays.idp[j] == id && !store.arrays.code[j].is_periodic())
                    .unwrap();
                let offset = (store.arrays.pos[i].x - store.arrays.pos[source].x).abs();
                prop_assert!((offset - 1.).abs() < 1e-12);
            }
            prop_assert_eq!(ghosts, copies);
        }
    }
}

#[test]
fn particles_outside_the_map_are_reported_by_block() {
    let (domain, _) = setup(false);
    let mut particles = cloud(7, 3, 10);
    particles[1].pos.x = 1.5;
    particles[5].pos.z = f64::NAN;
    particles[6].pos.y = -0.2;

    let mut store = ParticleStore::from_particles(&particles, 0., None).unwrap();
    let outcome = CellDivision::new().divide(&mut store, &domain, &ArrayBackendKind::Rayon.into());
    assert_eq!(outcome.boundary_out.len(), 1);
    assert_eq!(outcome.boundary_out[0].id, 1);
    let mut out: Vec<u32> = outcome.fluid_out.iter().map(|p| p.id).collect();
    out.sort_unstable();
    assert_eq!(out, vec![5, 6]);
    assert_eq!(store.np, 10);
    assert_eq!(store.npb, 2);
}
