use enum_dispatch::enum_dispatch;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Data-parallel primitives over particle arrays. Every implementation must
/// produce identical results for the same input.
#[enum_dispatch]
pub trait ArrayOps {
    fn for_each_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(&self, arr1: &mut [T1], f: F);

    fn for_each_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    );

    fn for_each_mut3<
        T1: Send + Sync,
        T2: Send + Sync,
        T3: Send + Sync,
        F: Fn(usize, &mut T1, &mut T2, &mut T3) + Send + Sync,
    >(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        f: F,
    );

    fn for_each_mut4<
        T1: Send + Sync,
        T2: Send + Sync,
        T3: Send + Sync,
        T4: Send + Sync,
        F: Fn(usize, &mut T1, &mut T2, &mut T3, &mut T4) + Send + Sync,
    >(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        arr4: &mut [T4],
        f: F,
    );

    fn map_collect<T: Send, F: Fn(usize) -> T + Send + Sync>(&self, n: usize, f: F) -> Vec<T>;

    /// Maximum of `f` over `0..n`, or 0 for an empty range.
    fn reduce_max<F: Fn(usize) -> f64 + Send + Sync>(&self, n: usize, f: F) -> f64;

    /// Stable sort of `0..keys.len()` by key.
    fn sorted_order(&self, keys: &[u32]) -> Vec<usize>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SerialBackend;

#[derive(Debug, Clone, Copy, Default)]
pub struct RayonBackend;

#[enum_dispatch(ArrayOps)]
#[derive(Debug, Clone, Copy)]
pub enum ArrayBackend {
    SerialBackend,
    RayonBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayBackendKind {
    Serial,
    Rayon,
}

impl Default for ArrayBackendKind {
    fn default() -> Self {
        ArrayBackendKind::Rayon
    }
}

impl From<ArrayBackendKind> for ArrayBackend {
    fn from(kind: ArrayBackendKind) -> Self {
        match kind {
            ArrayBackendKind::Serial => SerialBackend.into(),
            ArrayBackendKind::Rayon => RayonBackend.into(),
        }
    }
}

impl Default for ArrayBackend {
    fn default() -> Self {
        ArrayBackendKind::default().into()
    }
}

impl ArrayOps for SerialBackend {
    fn for_each_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(&self, arr1: &mut [T1], f: F) {
        arr1.iter_mut().enumerate().for_each(|(idx, v1)| {
            f(idx, v1);
        });
    }

    fn for_each_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    ) {
        arr1.iter_mut()
            .zip(arr2.iter_mut())
            .enumerate()
            .for_each(|(idx, (v1, v2))| {
                f(idx, v1, v2);
            });
    }

    fn for_each_mut3<
        T1: Send + Sync,
        T2: Send + Sync,
        T3: Send + Sync,
        F: Fn(usize, &mut T1, &mut T2, &mut T3) + Send + Sync,
    >(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        f: F,
    ) {
        arr1.iter_mut()
            .zip(arr2.iter_mut())
            .zip(arr3.iter_mut())
            .enumerate()
            .for_each(|(idx, ((v1, v2), v3))| {
                f(idx, v1, v2, v3);
            });
    }

    fn for_each_mut4<
        T1: Send + Sync,
        T2: Send + Sync,
        T3: Send + Sync,
        T4: Send + Sync,
        F: Fn(usize, &mut T1, &mut T2, &mut T3, &mut T4) + Send + Sync,
    >(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        arr4: &mut [T4],
        f: F,
    ) {
        arr1.iter_mut()
            .zip(arr2.iter_mut())
            .zip(arr3.iter_mut())
            .zip(arr4.iter_mut())
            .enumerate()
            .for_each(|(idx, (((v1, v2), v3), v4))| {
                f(idx, v1, v2, v3, v4);
            });
    }

    fn map_collect<T: Send, F: Fn(usize) -> T + Send + Sync>(&self, n: usize, f: F) -> Vec<T> {
        (0..n).map(f).collect()
    }

    fn reduce_max<F: Fn(usize) -> f64 + Send + Sync>(&self, n: usize, f: F) -> f64 {
        (0..n).map(f).fold(0., f64::max)
    }

    fn sorted_order(&self, keys: &[u32]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..keys.len()).collect();
        order.sort_by_key(|&i| keys[i]);
        order
    }
}

impl ArrayOps for RayonBackend {
    fn for_each_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(&self, arr1: &mut [T1], f: F) {
        arr1.par_iter_mut().enumerate().for_each(|(idx, v1)| {
            f(idx, v1);
        });
    }

    fn for_each_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    ) {
        arr1.par_iter_mut()
            .zip(arr2.par_iter_mut())
            .enumerate()
            .for_each(|(idx, (v1, v2))| {
                f(idx, v1, v2);
            });
    }

    fn for_each_mut3<
        T1: Send + Sync,
        T2: Send + Sync,
        T3: Send + Sync,
        F: Fn(usize, &mut T1, &mut T2, &mut T3) + Send + Sync,
    >(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        f: F,
    ) {
        arr1.par_iter_mut()
            .zip(arr2.par_iter_mut())
            .zip(arr3.par_iter_mut())
            .enumerate()
            .for_each(|(idx, ((v1, v2), v3))| {
                f(idx, v1, v2, v3);
            });
    }

    fn for_each_mut4<
        T1: Send + Sync,
        T2: Send + Sync,
        T3: Send + Sync,
        T4: Send + Sync,
        F: Fn(usize, &mut T1, &mut T2, &mut T3, &mut T4) + Send + Sync,
    >(
        &self,
        arr1: &mut [T1],
        arr2: &mut [T2],
        arr3: &mut [T3],
        arr4: &mut [T4],
        f: F,
    ) {
        arr1.par_iter_mut()
            .zip(arr2.par_iter_mut())
            .zip(arr3.par_iter_mut())
            .zip(arr4.par_iter_mut())
            .enumerate()
            .for_each(|(idx, (((v1, v2), v3), v4))| {
                f(idx, v1, v2, v3, v4);
            });
    }

    fn map_collect<T: Send, F: Fn(usize) -> T + Send + Sync>(&self, n: usize, f: F) -> Vec<T> {
        (0..n).into_par_iter().map(f).collect()
    }

    fn reduce_max<F: Fn(usize) -> f64 + Send + Sync>(&self, n: usize, f: F) -> f64 {
        (0..n).into_par_iter().map(f).reduce(|| 0., f64::max)
    }

    fn sorted_order(&self, keys: &[u32]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..keys.len()).collect();
        // par_sort_by_key is stable
        order.par_sort_by_key(|&i| keys[i]);
        order
    }
}
