use tracing::trace;

use crate::{
    cell_division::{Block, CellPartition},
    concurrency::{ArrayBackend, ArrayOps},
    domain::Domain,
    error::Result,
    floating_type_mod::FT,
    particle_code::Code,
    simulation_parameters::Constants,
    sph_kernels::CubicKernel,
    to_ft3, vel_of, V3, V4, VD3,
};

/// Which stage of the time step requests the forces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionStep {
    Verlet,
    SymPredictor,
    SymCorrector,
}

/// Read-only view of the divided particle set.
///
/// `[0, npb)` is the boundary block and `[npb, np)` the fluid block,
/// halo copies included.
#[derive(Clone, Copy)]
pub struct InteractionInput<'a> {
    pub step: InteractionStep,
    pub np: usize,
    pub npb: usize,
    pub code: &'a [Code],
    pub dcell: &'a [u32],
    pub pos: &'a [VD3],
    pub velrhop: &'a [V4],
    pub partition: &'a CellPartition,
    pub domain: &'a Domain,
    pub constants: &'a Constants,
    pub backend: &'a ArrayBackend,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InteractionStats {
    /// Largest `v_ij . r_ij / (r_ij^2 + eta^2)` over all interacting pairs.
    pub visc_dt_max: f64,
}

/// Computes per-particle acceleration (`ace`) and density derivative (`ar`)
/// for `[0, np)`. Both output slices hold exactly `np` entries.
///
/// Gravity is added to fluid particles only. Floating-body particles receive
/// the fluid forces alone; the body's weight is applied by the floating coupler.
pub trait ForceEvaluator {
    fn interact(&mut self, input: &InteractionInput, ace: &mut [V3], ar: &mut [FT]) -> Result<InteractionStats>;
}

/// Weakly compressible SPH: Tait equation of state, artificial viscosity and
/// the continuity equation.
#[derive(Debug, Clone)]
pub struct WcsphEvaluator {
    kernel: CubicKernel,
    visc_dt: Vec<f64>,
}

impl WcsphEvaluator {
    pub fn new(constants: &Constants) -> Self {
        WcsphEvaluator {
            kernel: CubicKernel::new(constants.h as FT, constants.simulate_2d),
            visc_dt: Vec::new(),
        }
    }

    pub fn pressure(constants: &Constants, rhop: FT) -> FT {
        constants.cte_b * ((rhop / constants.rhop0).powf(constants.gamma) - 1.)
    }
}

impl ForceEvaluator for WcsphEvaluator {
    fn interact(&mut self, input: &InteractionInput, ace: &mut [V3], ar: &mut [FT]) -> Result<InteractionStats> {
        let np = input.np;
        let c = input.constants;
        let kernel = self.kernel;
        let h = c.h as FT;
        let eta2 = 0.01 * h * h;
        let support2 = kernel.support_radius() * kernel.support_radius();

        self.visc_dt.clear();
        self.visc_dt.resize(np, 0.);

        input.backend.for_each_mut3(
            &mut ace[..np],
            &mut ar[..np],
            &mut self.visc_dt[..],
            |i, ace_i, ar_i, visc_i| {
                let pos_i = input.pos[i];
                let vr_i = input.velrhop[i];
                let vel_i = vel_of(&vr_i);
                let boundary_i = i < input.npb;
                let press_i = Self::pressure(c, vr_i.w);

                let mut acc = V3::zeros();
                let mut arp = 0.;
                let mut visc: FT = 0.;

                for block in [Block::Boundary, Block::Fluid] {
                    let boundary_j = block == Block::Boundary;
                    // boundary particles only feel the fluid block
                    if boundary_i && boundary_j {
                        continue;
                    }
                    let massp = if boundary_j { c.massb } else { c.massf };
                    let visco = if boundary_j {
                        c.visco * c.visco_bound_factor
                    } else {
                        c.visco
                    };

                    input
                        .partition
                        .for_each_neighbor_range(input.domain, input.dcell[i], block, |range| {
                            for j in range {
                                if j == i {
                                    continue;
                                }
                                let dr = to_ft3(&(pos_i - input.pos[j]));
                                let r2 = dr.norm_squared();
                                if r2 >= support2 || r2 <= FT::EPSILON {
                                    continue;
                                }
                                let frx = kernel.gradient(dr);
                                let vr_j = input.velrhop[j];
                                let dv = vel_i - vel_of(&vr_j);

                                arp += massp * dv.dot(&frx);

                                let dot = dv.dot(&dr);
                                let dot_rr2 = dot / (r2 + eta2);
                                visc = visc.max(dot_rr2);

                                if boundary_i {
                                    continue;
                                }
                                let press_j = Self::pressure(c, vr_j.w);
                                let prs = (press_i + press_j) / (vr_i.w * vr_j.w);
                                acc -= frx * (massp * prs);

                                if dot < 0. {
                                    let amubar = h * dot_rr2;
                                    let robar = (vr_i.w + vr_j.w) * 0.5;
                                    let pi_visc = -visco * c.cs0 * amubar / robar * massp;
                                    acc -= frx * pi_visc;
                                }
                            }
                        });
                }

                *ace_i = if boundary_i {
                    V3::zeros()
                } else if input.code[i].is_fluid() {
                    acc + c.gravity
                } else {
                    acc
                };
                *ar_i = arp;
                *visc_i = visc as f64;
            },
        );

        let visc_dt = &self.visc_dt;
        let visc_dt_max = input.backend.reduce_max(np, |i| visc_dt[i]);
        trace!("{:?} interaction: np={} visc_dt_max={}", input.step, np, visc_dt_max);
        Ok(InteractionStats { visc_dt_max })
    }
}

/// Applies gravity to fluid particles and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct GravityEvaluator;

impl ForceEvaluator for GravityEvaluator {
    fn interact(&mut self, input: &InteractionInput, ace: &mut [V3], ar: &mut [FT]) -> Result<InteractionStats> {
        let gravity = input.constants.gravity;
        let np = input.np;
        input.backend.for_each_mut2(&mut ace[..np], &mut ar[..np], |i, ace_i, ar_i| {
            *ace_i = if input.code[i].is_fluid() {
                gravity
            } else {
                V3::zeros()
            };
            *ar_i = 0.;
        });
        Ok(InteractionStats::default())
    }
}
