use crate::{
    floating_type_mod::{FT, PI},
    V3,
};

pub fn cubic_kernel_unnormalized(q: FT) -> FT {
    if q < 0.5 {
        6. * (q * q * q - q * q) + 1.
    } else if q < 1. {
        let v = 1. - q;
        2. * (v * v * v)
    } else {
        0.
    }
}

pub fn cubic_kernel_unnormalized_deriv(q: FT) -> FT {
    if q < 0.5 {
        18. * q * q - 12. * q
    } else if q < 1. {
        let v = 1. - q;
        -6. * v * v
    } else {
        0.
    }
}

/**
 * Cubic spline with support radius 2h.
 *
 * Positions are always three-dimensional. In 2-D runs the y component of every
 * separation is zero and only the normalization changes.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubicKernel {
    h: FT,
    norm_factor: FT,
}

impl CubicKernel {
    pub fn new(h: FT, simulate_2d: bool) -> Self {
        let norm_factor = if simulate_2d {
            10. / (7. * PI * (h * h))
        } else {
            1. / (PI * (h * h * h))
        };
        CubicKernel { h, norm_factor }
    }

    pub fn smoothing_length(&self) -> FT {
        self.h
    }

    pub fn support_radius(&self) -> FT {
        2. * self.h
    }

    /// `r` is the distance to the center.
    pub fn value(&self, r: FT) -> FT {
        self.norm_factor * cubic_kernel_unnormalized(r / (2. * self.h))
    }

    /**
     * Calculate the derivative dW/dx where W=kernel(|x-y|/h) and x-y=diff.
     */
    pub fn gradient(&self, diff: V3) -> V3 {
        let r = diff.norm();
        let q = r / (2. * self.h);
        if q <= 1.0e-5 {
            return V3::zeros();
        }
        diff * (self.norm_factor * cubic_kernel_unnormalized_deriv(q) / (2. * self.h) / r)
    }
}
