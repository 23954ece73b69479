use itertools::izip;
use num_traits::Float;

use crate::ElementUnaryOpType;

fn c<T: Float>(v: f64) -> T {
    T::from(v).unwrap_or_else(T::nan)
}

fn gelu_inner<T: Float>(x: T) -> T {
    c::<T>(0.797_884_6) * (x + c::<T>(0.044715) * x * x * x)
}

fn apply<T: Float>(op: ElementUnaryOpType, scalar: T, x: T) -> T {
    use ElementUnaryOpType::*;
    match op {
        Identity => x,
        Relu => x.max(T::zero()),
        Sigmoid => T::one() / (T::one() + (-x).exp()),
        Tanh => x.tanh(),
        Elu => {
            if x > T::zero() {
                x
            } else {
                x.exp_m1()
            }
        }
        Exp => x.exp(),
        Sin => x.sin(),
        Cos => x.cos(),
        Gelu => c::<T>(0.5) * x * (T::one() + gelu_inner(x).tanh()),
        Rsqrt => x.sqrt().recip(),
        ScalarMultiply => x * scalar,
        ScalarAdd => x + scalar,
        ScalarSub => x - scalar,
        ScalarTrueDiv => x / scalar,
        Pow => x.powf(scalar),
    }
}

/// dy/dx at input `x` with forward result `y`.
fn derivative<T: Float>(op: ElementUnaryOpType, scalar: T, x: T, y: T) -> T {
    use ElementUnaryOpType::*;
    match op {
        Identity | ScalarAdd | ScalarSub => T::one(),
        Relu => {
            if x > T::zero() {
                T::one()
            } else {
                T::zero()
            }
        }
        Sigmoid => y * (T::one() - y),
        Tanh => T::one() - y * y,
        Elu => {
            if x > T::zero() {
                T::one()
            } else {
                y + T::one()
            }
        }
        Exp => y,
        Sin => x.cos(),
        Cos => -x.sin(),
        Gelu => {
            let t = gelu_inner(x).tanh();
            let du = c::<T>(0.797_884_6) * (T::one() + c::<T>(3.0 * 0.044715) * x * x);
            c::<T>(0.5) * (T::one() + t) + c::<T>(0.5) * x * (T::one() - t * t) * du
        }
        Rsqrt => c::<T>(-0.5) * y * y * y,
        ScalarMultiply => scalar,
        ScalarTrueDiv => scalar.recip(),
        Pow => scalar * x.powf(scalar - T::one()),
    }
}

pub(crate) fn unary_forward<T: Float>(
    op: ElementUnaryOpType,
    scalar: T,
    input: &[T],
    output: &mut [T],
) {
    for (x, y) in input.iter().zip(output.iter_mut()) {
        *y = apply(op, scalar, *x);
    }
}

/// Accumulates `output_grad * f'(input)` into `input_grad`.
pub(crate) fn unary_backward<T: Float>(
    op: ElementUnaryOpType,
    scalar: T,
    input: &[T],
    output: &[T],
    output_grad: &[T],
    input_grad: &mut [T],
) {
    for (x, y, dy, dx) in izip!(input, output, output_grad, input_grad.iter_mut()) {
        *dx = *dx + *dy * derivative(op, scalar, *x, *y);
    }
}
