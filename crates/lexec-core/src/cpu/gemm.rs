use gemm::{gemm, Parallelism};

/// Dimensions of `dst[m, n] = lhs[m, k] · rhs[k, n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_new::new)]
pub(crate) struct MatmulDims {
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

/// `dst (+)= lhs · rhs` over contiguous row-major buffers.
///
/// `trans_lhs` means `lhs` is stored as `[k, m]`, `trans_rhs` that `rhs` is
/// stored as `[n, k]`. With `accumulate` the product is added to `dst`,
/// otherwise `dst` is overwritten.
pub(crate) fn matmul(
    lhs: &[f32],
    rhs: &[f32],
    dst: &mut [f32],
    dims: MatmulDims,
    trans_lhs: bool,
    trans_rhs: bool,
    accumulate: bool,
) {
    let MatmulDims { m, k, n } = dims;
    assert_eq!(lhs.len(), m * k);
    assert_eq!(rhs.len(), k * n);
    assert_eq!(dst.len(), m * n);
    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        if !accumulate {
            dst.fill(0.0);
        }
        return;
    }

    // Row and column strides of each operand as it is read.
    let (lhs_rs, lhs_cs) = if trans_lhs { (1, m as isize) } else { (k as isize, 1) };
    let (rhs_rs, rhs_cs) = if trans_rhs { (1, k as isize) } else { (n as isize, 1) };
    let (dst_rs, dst_cs) = (n as isize, 1);

    unsafe {
        gemm(
            m,
            n,
            k,
            dst.as_mut_ptr(),
            dst_cs,
            dst_rs,
            accumulate,
            lhs.as_ptr(),
            lhs_cs,
            lhs_rs,
            rhs.as_ptr(),
            rhs_cs,
            rhs_rs,
            1.0,
            1.0,
            false,
            false,
            false,
            Parallelism::None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // [[1, 2, 3], [4, 5, 6]]
    const A: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    // [[1, 0], [0, 1], [1, 1]]
    const B: [f32; 6] = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];

    #[test]
    fn plain_product() {
        let mut dst = [0.0; 4];
        matmul(&A, &B, &mut dst, MatmulDims::new(2, 3, 2), false, false, false);
        assert_eq!(dst, [4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn transposed_operands() {
        // A^T · A: lhs stored [2, 3] read as [3, 2].
        let mut dst = [0.0; 9];
        matmul(&A, &A, &mut dst, MatmulDims::new(3, 2, 3), true, false, false);
        assert_eq!(dst, [17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]);

        // A · A^T: rhs stored [2, 3] read as [3, 2].
        let mut dst = [0.0; 4];
        matmul(&A, &A, &mut dst, MatmulDims::new(2, 3, 2), false, true, false);
        assert_eq!(dst, [14.0, 32.0, 32.0, 77.0]);
    }

    #[test]
    fn accumulates_into_dst() {
        let mut dst = [1.0; 4];
        matmul(&A, &B, &mut dst, MatmulDims::new(2, 3, 2), false, false, true);
        assert_eq!(dst, [5.0, 6.0, 11.0, 12.0]);
        matmul(&A, &B, &mut dst, MatmulDims::new(2, 3, 2), false, false, false);
        assert_eq!(dst, [4.0, 5.0, 10.0, 11.0]);
    }
}
