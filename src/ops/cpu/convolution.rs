//! Convolution, its two gradients, and sliding windows.
//!
//! Images are `[p1..pn, c]` with the channel dimension last. A kernel is
//! `[k1..kn, c]`, or `[f, k1..kn, c]` for `f` filters; in the latter case the
//! filter index becomes the last output dimension.

use crate::graph::shape::{acc_sizes, numel, window_count};
use crate::tensors::Element;

/// Precomputed geometry of one convolution.
#[derive(Debug, Clone)]
pub struct ConvGeometry {
    image: Vec<usize>,
    acc_image: Vec<usize>,
    /// Spatial kernel extents (no filter, no channel).
    kernel: Vec<usize>,
    acc_kernel: Vec<usize>,
    /// Spatial output extents (no filter dimension).
    out: Vec<usize>,
    acc_out: Vec<usize>,
    steps: Vec<usize>,
    channels: usize,
    filters: usize,
}

impl ConvGeometry {
    pub fn new(image: &[usize], kernel: &[usize], steps: &[usize]) -> Self {
        let n = image.len() - 1;
        let multi = kernel.len() == image.len() + 1;
        let filters = if multi { kernel[0] } else { 1 };
        let spatial = if multi { &kernel[1..=n] } else { &kernel[..n] };
        let out: Vec<usize> = (0..n).map(|d| 1 + (image[d] - 1) / steps[d]).collect();
        Self {
            image: image[..n].to_vec(),
            acc_image: acc_sizes(image),
            kernel: spatial.to_vec(),
            acc_kernel: acc_sizes(spatial),
            acc_out: acc_sizes(&out),
            out,
            steps: steps.to_vec(),
            channels: image[n],
            filters,
        }
    }

    fn spatial_kernel_count(&self) -> usize {
        numel(&self.kernel)
    }

    fn spatial_out_count(&self) -> usize {
        numel(&self.out)
    }

    /// Image offset of kernel tap `kp` applied at output position `os`, if inside.
    #[inline]
    fn tap(&self, os: usize, kp: usize) -> Option<usize> {
        let mut offset = 0;
        for d in 0..self.image.len() {
            let o = (os / self.acc_out[d]) % self.out[d];
            let k = (kp / self.acc_kernel[d]) % self.kernel[d];
            let p = o * self.steps[d] + k;
            if p >= self.image[d] {
                return None;
            }
            offset += p * self.acc_image[d];
        }
        Some(offset)
    }

    pub fn forward<T: Element>(&self, image: &[T], kernel: &[T], from: usize, out: &mut [T]) {
        let c = self.channels;
        let taps = self.spatial_kernel_count();
        for (k, v) in out.iter_mut().enumerate() {
            let i = from + k;
            let (os, f) = (i / self.filters, i % self.filters);
            let kbase = f * taps * c;
            let mut sum = T::zero();
            for kp in 0..taps {
                if let Some(offset) = self.tap(os, kp) {
                    for ch in 0..c {
                        sum = sum.wrapping_add(image[offset + ch].wrapping_mul(kernel[kbase + kp * c + ch]));
                    }
                }
            }
            *v = sum;
        }
    }

    /// Gradient w.r.t. the image: every output position whose window covered
    /// the image element contributes `adjoint * kernel tap`.
    pub fn image_gradient<T: Element>(&self, kernel: &[T], adj: &[T], from: usize, out: &mut [T]) {
        let c = self.channels;
        let n = self.image.len();
        let taps = self.spatial_kernel_count();
        for (k, v) in out.iter_mut().enumerate() {
            let i = from + k;
            let ch = i % c;
            let mut sum = T::zero();
            'taps: for kp in 0..taps {
                let mut os = 0;
                for d in 0..n {
                    let p = (i / self.acc_image[d]) % self.image[d];
                    let kd = (kp / self.acc_kernel[d]) % self.kernel[d];
                    if p < kd || (p - kd) % self.steps[d] != 0 {
                        continue 'taps;
                    }
                    let o = (p - kd) / self.steps[d];
                    if o >= self.out[d] {
                        continue 'taps;
                    }
                    os += o * self.acc_out[d];
                }
                for f in 0..self.filters {
                    let kidx = (f * taps + kp) * c + ch;
                    sum = sum.wrapping_add(kernel[kidx].wrapping_mul(adj[os * self.filters + f]));
                }
            }
            *v = sum;
        }
    }

    /// Gradient w.r.t. the kernel: sum over output positions of
    /// `adjoint * image element under the tap`.
    pub fn kernel_gradient<T: Element>(&self, image: &[T], adj: &[T], from: usize, out: &mut [T]) {
        let c = self.channels;
        let taps = self.spatial_kernel_count();
        for (k, v) in out.iter_mut().enumerate() {
            let i = from + k;
            let f = i / (taps * c);
            let kp = (i / c) % taps;
            let ch = i % c;
            let mut sum = T::zero();
            for os in 0..self.spatial_out_count() {
                if let Some(offset) = self.tap(os, kp) {
                    sum = sum.wrapping_add(image[offset + ch].wrapping_mul(adj[os * self.filters + f]));
                }
            }
            *v = sum;
        }
    }
}

/// Geometry of a sliding window over a tensor of extents `extent`.
#[derive(Debug, Clone)]
pub struct Windows {
    extent: Vec<usize>,
    acc_extent: Vec<usize>,
    size: Vec<usize>,
    acc_size: Vec<usize>,
    counts: Vec<usize>,
    acc_counts: Vec<usize>,
    steps: Vec<usize>,
    window_len: usize,
}

impl Windows {
    pub fn new(extent: &[usize], size: &[usize], steps: &[usize]) -> Self {
        let counts: Vec<usize> = (0..extent.len())
            .map(|d| window_count(extent[d], size[d], steps[d]))
            .collect();
        Self {
            extent: extent.to_vec(),
            acc_extent: acc_sizes(extent),
            size: size.to_vec(),
            acc_size: acc_sizes(size),
            acc_counts: acc_sizes(&counts),
            counts,
            steps: steps.to_vec(),
            window_len: numel(size),
        }
    }

    /// Source index of element `i` of the `[windows, size..]` output.
    #[inline]
    pub fn source(&self, i: usize) -> usize {
        let (w, r) = (i / self.window_len, i % self.window_len);
        (0..self.extent.len())
            .map(|d| {
                let wd = (w / self.acc_counts[d]) % self.counts[d];
                let rd = (r / self.acc_size[d]) % self.size[d];
                (wd * self.steps[d] + rd) * self.acc_extent[d]
            })
            .sum()
    }

    /// Sums, for each element of the original tensor, every window element that
    /// was copied from it.
    pub fn unslide<T: Element>(&self, windows: &[T], from: usize, out: &mut [T]) {
        let n = self.extent.len();
        let mut lo = vec![0; n];
        let mut hi = vec![0; n];
        let mut w = vec![0; n];
        for (k, v) in out.iter_mut().enumerate() {
            let i = from + k;
            let mut empty = false;
            for d in 0..n {
                let p = (i / self.acc_extent[d]) % self.extent[d];
                let (s, t) = (self.size[d], self.steps[d]);
                lo[d] = if p + 1 >= s { (p + 1 - s).div_ceil(t) } else { 0 };
                hi[d] = (p / t).min(self.counts[d] - 1);
                empty |= lo[d] > hi[d];
            }
            let mut sum = T::zero();
            if !empty {
                w.copy_from_slice(&lo);
                loop {
                    let mut widx = 0;
                    let mut ridx = 0;
                    for d in 0..n {
                        let p = (i / self.acc_extent[d]) % self.extent[d];
                        widx += w[d] * self.acc_counts[d];
                        ridx += (p - w[d] * self.steps[d]) * self.acc_size[d];
                    }
                    sum = sum.wrapping_add(windows[widx * self.window_len + ridx]);
                    // odometer step over [lo, hi]
                    let mut d = n;
                    let advanced = loop {
                        if d == 0 {
                            break false;
                        }
                        d -= 1;
                        if w[d] < hi[d] {
                            w[d] += 1;
                            break true;
                        }
                        w[d] = lo[d];
                    };
                    if !advanced {
                        break;
                    }
                }
            }
            *v = sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_filter_convolution() {
        // 1-D image of 4 pixels, 1 channel, kernel of 2 taps, step 1
        let g = ConvGeometry::new(&[4, 1], &[2, 1], &[1]);
        let mut out = [0.0f64; 4];
        g.forward(&[1.0, 2.0, 3.0, 4.0], &[1.0, 10.0], 0, &mut out);
        // the last position only sees one tap inside the image
        assert_eq!(out, [21.0, 32.0, 43.0, 4.0]);
    }

    #[test]
    fn test_image_gradient_matches_finite_sum() {
        let g = ConvGeometry::new(&[4, 1], &[2, 1], &[2]);
        // outputs at positions 0 and 2
        let mut grad = [0.0f64; 4];
        g.image_gradient(&[1.0, 10.0], &[1.0, 1.0], 0, &mut grad);
        assert_eq!(grad, [1.0, 10.0, 1.0, 10.0]);
        let mut kgrad = [0.0f64; 2];
        g.kernel_gradient(&[1.0, 2.0, 3.0, 4.0], &[1.0, 1.0], 0, &mut kgrad);
        assert_eq!(kgrad, [4.0, 6.0]);
    }

    #[test]
    fn test_sliding_window_and_unslide() {
        let w = Windows::new(&[5], &[2], &[2]);
        let idx: Vec<usize> = (0..4).map(|i| w.source(i)).collect();
        assert_eq!(idx, vec![0, 1, 2, 3]);
        let overlapping = Windows::new(&[3], &[2], &[1]);
        let mut out = [0i32; 3];
        overlapping.unslide(&[1, 2, 3, 4], 0, &mut out);
        assert_eq!(out, [1, 5, 4]);
    }
}
