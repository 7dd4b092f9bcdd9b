use crate::{
    error::{Result, SimulationError},
    simulation_parameters::{Constants, SimulationParams},
    V, VD3,
};

pub type VU3 = V<u32, 3>;

/// One active periodic direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodicAxis {
    pub axis: usize,
    /// Offset between a particle and its image across the lower face.
    pub inc: VD3,
}

/// Simulated volume and the uniform cell lattice laid over it.
///
/// `real_min..real_max` is the simulated volume. On periodic axes the map is
/// widened by one kernel support radius (`dosh`) to host halo copies.
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
    pub real_min: VD3,
    pub real_max: VD3,
    pub map_min: VD3,
    pub map_max: VD3,
    pub periodic: Vec<PeriodicAxis>,
    pub dosh: f64,
    pub scell: f64,
    pub hdiv: u32,
    pub ncells: VU3,
    pub simulate_2d: bool,
}

impl Domain {
    pub fn new(params: &SimulationParams, constants: &Constants, positions: &[VD3]) -> Result<Domain> {
        let (real_min, real_max) = match &params.domain {
            Some(bounds) => (VD3::from(bounds.min), VD3::from(bounds.max)),
            None => {
                if positions.is_empty() {
                    return Err(SimulationError::InvalidConfig(
                        "cannot derive the domain of an empty case".into(),
                    ));
                }
                let mut min = positions[0];
                let mut max = positions[0];
                for p in positions {
                    min = min.inf(p);
                    max = max.sup(p);
                }
                let size = max - min;
                let margin = size.map(|s| (s * params.domain_margin).max(constants.dosh));
                (min - margin, max + margin)
            }
        };

        let mut periodic = Vec::new();
        let flags = [params.periodic.x, params.periodic.y, params.periodic.z];
        let incs = [params.periodic.x_inc, params.periodic.y_inc, params.periodic.z_inc];
        for axis in 0..3 {
            if !flags[axis] {
                continue;
            }
            let inc = match incs[axis] {
                Some(inc) => VD3::from(inc),
                None => {
                    let mut inc = VD3::zeros();
                    inc[axis] = real_max[axis] - real_min[axis];
                    inc
                }
            };
            if !(inc[axis] > 2. * constants.dosh) {
                return Err(SimulationError::InvalidConfig(format!(
                    "periodic increment along axis {} must exceed twice the kernel support",
                    axis
                )));
            }
            periodic.push(PeriodicAxis { axis, inc });
        }

        Domain::from_bounds(real_min, real_max, periodic, constants)
    }

    pub fn from_bounds(
        real_min: VD3,
        real_max: VD3,
        periodic: Vec<PeriodicAxis>,
        constants: &Constants,
    ) -> Result<Domain> {
        let mut map_min = real_min;
        let mut map_max = real_max;
        for p in &periodic {
            map_min[p.axis] -= constants.dosh;
            map_max[p.axis] += constants.dosh;
        }

        let scell = constants.scell;
        let mut ncells = VU3::zeros();
        for d in 0..3 {
            let n = ((map_max[d] - map_min[d]) / scell).ceil().max(1.);
            if !n.is_finite() || n > u32::MAX as f64 {
                return Err(SimulationError::InvalidConfig("domain is too large for the cell size".into()));
            }
            ncells[d] = n as u32;
        }
        if constants.simulate_2d {
            ncells.y = 1;
        }
        let nct = ncells.iter().map(|&n| n as u64).product::<u64>();
        if nct > (u32::MAX / 4) as u64 {
            return Err(SimulationError::InvalidConfig(format!(
                "{} cells exceed the addressable cell range",
                nct
            )));
        }

        Ok(Domain {
            real_min,
            real_max,
            map_min,
            map_max,
            periodic,
            dosh: constants.dosh,
            scell,
            hdiv: constants.hdiv,
            ncells,
            simulate_2d: constants.simulate_2d,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.ncells.iter().map(|&n| n as usize).product()
    }

    pub fn is_periodic(&self) -> bool {
        !self.periodic.is_empty()
    }

    /// Cell coordinate of `pos`, or `None` when the position lies outside the
    /// map or is not finite.
    pub fn cell_of(&self, pos: &VD3) -> Option<VU3> {
        let mut cell = VU3::zeros();
        for d in 0..3 {
            if d == 1 && self.simulate_2d {
                if !pos[d].is_finite() {
                    return None;
                }
                continue;
            }
            let x = pos[d];
            // also rejects NaN
            if !(x >= self.map_min[d] && x < self.map_max[d]) {
                return None;
            }
            let c = ((x - self.map_min[d]) / self.scell).floor() as u32;
            cell[d] = c.min(self.ncells[d] - 1);
        }
        Some(cell)
    }

    pub fn cell_index(&self, cell: &VU3) -> u32 {
        cell.x + cell.y * self.ncells.x + cell.z * self.ncells.x * self.ncells.y
    }

    pub fn cell_coords(&self, index: u32) -> VU3 {
        let nxy = self.ncells.x * self.ncells.y;
        VU3::new(index % self.ncells.x, (index % nxy) / self.ncells.x, index / nxy)
    }

    /// Moves a position that crossed a periodic face back into the simulated volume.
    pub fn wrap_periodic(&self, pos: &mut VD3) {
        for p in &self.periodic {
            if pos[p.axis] < self.real_min[p.axis] {
                *pos += p.inc;
            } else if pos[p.axis] >= self.real_max[p.axis] {
                *pos -= p.inc;
            }
        }
    }

    /// Shortest image of a separation vector under the periodic lattice.
    pub fn periodic_distance(&self, mut dist: VD3) -> VD3 {
        for p in &self.periodic {
            let norm = dist.norm_squared();
            if (dist - p.inc).norm_squared() < norm {
                dist -= p.inc;
            } else if (dist + p.inc).norm_squared() < norm {
                dist += p.inc;
            }
        }
        dist
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{simulation_parameters::tests::minimal_params, vec3d};

    /// Unit box with h = 0.05 (scell = 0.1), optionally periodic along x.
    pub(crate) fn unit_box(periodic_x: bool, simulate_2d: bool) -> (Domain, Constants) {
        let mut params = minimal_params();
        params.h = Some(0.05);
        params.simulate_2d = simulate_2d;
        params.periodic.x = periodic_x;
        params.domain = Some(crate::simulation_parameters::DomainBounds {
            min: [0., 0., 0.],
            max: [1., 1., 1.],
        });
        let constants = params.constants(0.025).unwrap();
        (Domain::new(&params, &constants, &[]).unwrap(), constants)
    }

    #[test]
    fn cells_cover_the_map() {
        let (domain, _) = unit_box(false, false);
        assert_eq!(domain.ncells, VU3::new(10, 10, 10));
        assert_eq!(domain.cell_of(&vec3d(0., 0., 0.)), Some(VU3::new(0, 0, 0)));
        assert_eq!(domain.cell_of(&vec3d(0.95, 0.05, 0.55)), Some(VU3::new(9, 0, 5)));
        assert_eq!(domain.cell_of(&vec3d(1.0, 0.5, 0.5)), None);
        assert_eq!(domain.cell_of(&vec3d(f64::NAN, 0.5, 0.5)), None);
        assert_eq!(domain.cell_of(&vec3d(0.5, f64::INFINITY, 0.5)), None);

        let c = VU3::new(3, 7, 2);
        assert_eq!(domain.cell_coords(domain.cell_index(&c)), c);
    }

    #[test]
    fn periodic_axis_widens_map() {
        let (domain, constants) = unit_box(true, false);
        assert_eq!(domain.periodic.len(), 1);
        assert_eq!(domain.periodic[0].inc, vec3d(1., 0., 0.));
        assert_eq!(domain.map_min.x, -constants.dosh);
        assert_eq!(domain.map_max.x, 1. + constants.dosh);
        assert!(domain.cell_of(&vec3d(-0.05, 0.5, 0.5)).is_some());

        let mut p = vec3d(1.02, 0.5, 0.5);
        domain.wrap_periodic(&mut p);
        assert!((p.x - 0.02).abs() < 1e-12);

        let d = domain.periodic_distance(vec3d(0.9, 0.1, 0.));
        assert!((d.x + 0.1).abs() < 1e-12);
    }

    #[test]
    fn two_dimensional_domain_has_one_cell_layer() {
        let (domain, _) = unit_box(false, true);
        assert_eq!(domain.ncells.y, 1);
        assert_eq!(domain.cell_of(&vec3d(0.5, 123., 0.5)).map(|c| c.y), Some(0));
    }
}
