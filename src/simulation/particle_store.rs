use std::collections::TryReserveError;

use tracing::debug;

use crate::{
    concurrency::{ArrayBackend, ArrayOps},
    error::{Result, SimulationError},
    floating_type_mod::FT,
    particle_code::Code,
    V3, V4, VD3,
};

fn realloc_array<T: Copy>(old: &[T], capacity: usize, default: impl FnMut() -> T) -> Result<Vec<T>, TryReserveError> {
    let mut v = Vec::new();
    v.try_reserve_exact(capacity.max(old.len()))?;
    v.extend_from_slice(old);
    v.resize_with(capacity, default);
    Ok(v)
}

fn gather_array<T: Copy + Send + Sync>(arr: &mut [T], order: &[usize], backend: &ArrayBackend) {
    let gathered = {
        let src: &[T] = &*arr;
        backend.map_collect(order.len(), |i| src[order[i]])
    };
    arr[..order.len()].copy_from_slice(&gathered);
}

/// Declares a struct of co-indexed particle arrays. Required arrays always span
/// the full capacity; auxiliary arrays are allocated on demand and tracked by
/// the generated `AuxArray` enum. Every reordering or copy touches all
/// allocated arrays at once.
macro_rules! decl_particle_arrays {
    (
        pub struct $struct_name:ident {
            $(pub $field_name:ident: Vec<$field_type:ty> | $default_value:expr),* $(,)?
        }
        aux {
            $($aux_variant:ident => pub $aux_name:ident: Vec<$aux_type:ty> | $aux_default:expr),* $(,)?
        }
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum AuxArray {
            $($aux_variant,)*
        }

        impl AuxArray {
            pub const ALL: &'static [AuxArray] = &[$(AuxArray::$aux_variant,)*];
        }

        #[derive(Debug, Clone)]
        pub struct $struct_name {
            $(
                pub $field_name: Vec<$field_type>,
            )*
            $(
                pub $aux_name: Option<Vec<$aux_type>>,
            )*
        }

        impl $struct_name {
            pub fn with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
                Ok(Self {
                    $(
                        $field_name: realloc_array(&[], capacity, || $default_value)?,
                    )*
                    $(
                        $aux_name: None,
                    )*
                })
            }

            pub fn capacity(&self) -> usize {
                let lens = [$(self.$field_name.len(),)*];
                lens[0]
            }

            /// All-or-nothing reallocation: every new array is allocated before
            /// any old one is replaced. The first `keep` entries are preserved.
            pub fn try_resize(&mut self, capacity: usize, keep: usize) -> Result<(), TryReserveError> {
                $(
                    let $field_name = realloc_array(&self.$field_name[..keep], capacity, || $default_value)?;
                )*
                $(
                    let $aux_name = match &self.$aux_name {
                        Some(old) => Some(realloc_array(&old[..keep], capacity, || $aux_default)?),
                        None => None,
                    };
                )*
                $(
                    self.$field_name = $field_name;
                )*
                $(
                    self.$aux_name = $aux_name;
                )*
                Ok(())
            }

            /// Entry `i` receives old entry `order[i]` for `i < order.len()`.
            pub fn gather(&mut self, order: &[usize], backend: &ArrayBackend) {
                $(
                    gather_array(&mut self.$field_name, order, backend);
                )*
                $(
                    if let Some(arr) = &mut self.$aux_name {
                        gather_array(arr, order, backend);
                    }
                )*
            }

            pub fn copy_particle(&mut self, src: usize, dst: usize) {
                $(
                    self.$field_name[dst] = self.$field_name[src];
                )*
                $(
                    if let Some(arr) = &mut self.$aux_name {
                        arr[dst] = arr[src];
                    }
                )*
            }

            pub fn is_allocated(&self, aux: AuxArray) -> bool {
                match aux {
                    $(
                        AuxArray::$aux_variant => self.$aux_name.is_some(),
                    )*
                }
            }

            pub fn allocate(&mut self, aux: AuxArray) -> Result<(), TryReserveError> {
                let capacity = self.capacity();
                match aux {
                    $(
                        AuxArray::$aux_variant => {
                            if self.$aux_name.is_none() {
                                self.$aux_name = Some(realloc_array(&[], capacity, || $aux_default)?);
                            }
                        }
                    )*
                }
                Ok(())
            }

            pub fn free(&mut self, aux: AuxArray) {
                match aux {
                    $(
                        AuxArray::$aux_variant => self.$aux_name = None,
                    )*
                }
            }
        }
    }
}

decl_particle_arrays! {
    pub struct ParticleArrays {
        pub idp: Vec<u32> | 0,
        pub code: Vec<Code> | Code::default(),
        pub dcell: Vec<u32> | 0,
        pub pos: Vec<VD3> | VD3::zeros(),
        pub velrhop: Vec<V4> | V4::zeros(),
    }
    aux {
        // Verlet history
        VelrhopM1 => pub velrhop_m1: Vec<V4> | V4::zeros(),

        // Symplectic state at the start of the step
        PosPre => pub pos_pre: Vec<VD3> | VD3::zeros(),
        VelrhopPre => pub velrhop_pre: Vec<V4> | V4::zeros(),

        // interaction output
        Ace => pub ace: Vec<V3> | V3::zeros(),
        Ar => pub ar: Vec<FT> | 0.,
    }
}

/// Initial state of one particle as delivered by the case loader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleInit {
    pub id: u32,
    pub code: Code,
    pub pos: VD3,
    pub velrhop: V4,
}

/// Owner of every per-particle array plus the live counts.
///
/// Entries `[0, np)` are live. After a partition, `[0, npb)` is the boundary
/// block (including its halo copies) and `[npb, np)` the fluid block.
#[derive(Debug, Clone)]
pub struct ParticleStore {
    pub arrays: ParticleArrays,
    pub np: usize,
    pub npb: usize,
    pub npb_per: usize,
    pub npf_per: usize,
    capacity_ceiling: Option<usize>,
    resize_count: usize,
    max_capacity: usize,
}

impl ParticleStore {
    pub fn new(capacity: usize, capacity_ceiling: Option<usize>) -> Result<ParticleStore> {
        if let Some(ceiling) = capacity_ceiling {
            if capacity > ceiling {
                return Err(SimulationError::CapacityExhausted {
                    requested: capacity,
                    ceiling,
                });
            }
        }
        let arrays = ParticleArrays::with_capacity(capacity)
            .map_err(|source| SimulationError::Allocation { capacity, source })?;
        Ok(ParticleStore {
            arrays,
            np: 0,
            npb: 0,
            npb_per: 0,
            npf_per: 0,
            capacity_ceiling,
            resize_count: 0,
            max_capacity: capacity,
        })
    }

    /// Loads case particles, boundary block first. The order inside each block is kept.
    pub fn from_particles(
        particles: &[ParticleInit],
        over_fraction: f32,
        capacity_ceiling: Option<usize>,
    ) -> Result<ParticleStore> {
        let capacity = capacity_with_margin(particles.len(), over_fraction, capacity_ceiling)?;
        let mut store = ParticleStore::new(capacity, capacity_ceiling)?;

        let (boundary, fluid): (Vec<&ParticleInit>, Vec<&ParticleInit>) =
            particles.iter().partition(|p| p.code.is_boundary());

        for (i, p) in boundary.iter().chain(fluid.iter()).enumerate() {
            store.arrays.idp[i] = p.id;
            store.arrays.code[i] = p.code;
            store.arrays.pos[i] = p.pos;
            store.arrays.velrhop[i] = p.velrhop;
        }
        store.np = particles.len();
        store.npb = boundary.len();
        Ok(store)
    }

    pub fn capacity(&self) -> usize {
        self.arrays.capacity()
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn resize_count(&self) -> usize {
        self.resize_count
    }

    /// Live particles excluding halo copies.
    pub fn num_real(&self) -> usize {
        self.np - self.npb_per - self.npf_per
    }

    /// Reallocates every array to hold at least `new_count * (1 + over_fraction)`
    /// particles, preserving the first `np` entries and their order.
    pub fn resize(&mut self, new_count: usize, over_fraction: f32) -> Result<usize> {
        if new_count < self.np {
            return Err(SimulationError::ResizeBelowCount {
                requested: new_count,
                np: self.np,
            });
        }
        let capacity = capacity_with_margin(new_count, over_fraction, self.capacity_ceiling)?;
        debug!(
            "resizing particle arrays: {} -> {} (np={})",
            self.capacity(),
            capacity,
            self.np
        );
        self.arrays
            .try_resize(capacity, self.np)
            .map_err(|source| SimulationError::Allocation { capacity, source })?;
        self.resize_count += 1;
        self.max_capacity = self.max_capacity.max(capacity);
        Ok(capacity)
    }

    pub fn allocate(&mut self, aux: AuxArray) -> Result<()> {
        let capacity = self.capacity();
        self.arrays
            .allocate(aux)
            .map_err(|source| SimulationError::Allocation { capacity, source })
    }

    pub fn free(&mut self, aux: AuxArray) {
        self.arrays.free(aux);
    }

    /// Whether the Symplectic pre-step buffers are present. Partial allocation is an error.
    pub fn has_symplectic_buffers(&self) -> Result<bool> {
        let pos_pre = self.arrays.is_allocated(AuxArray::PosPre);
        let velrhop_pre = self.arrays.is_allocated(AuxArray::VelrhopPre);
        match (pos_pre, velrhop_pre) {
            (true, true) => Ok(true),
            (false, false) => Ok(false),
            _ => Err(SimulationError::InvalidSymplecticState),
        }
    }
}

fn capacity_with_margin(count: usize, over_fraction: f32, ceiling: Option<usize>) -> Result<usize> {
    let margin = if over_fraction > 0. {
        (count as f64 * over_fraction as f64) as usize
    } else {
        0
    };
    let capacity = count + margin;
    match ceiling {
        Some(ceiling) if count > ceiling => Err(SimulationError::CapacityExhausted {
            requested: count,
            ceiling,
        }),
        Some(ceiling) => Ok(capacity.min(ceiling)),
        None => Ok(capacity),
    }
}
