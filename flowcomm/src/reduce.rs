//! Reduction functions applied by reduce-family receivers.
//!
//! The engine combines values in arrival order per source pair and never
//! fixes a global order, so a function only needs to be associative.

use crate::types::ReduceOp;

/// Associative binary combination of two values.
pub trait ReduceFunction<T>: Send + Sync {
    fn reduce(&self, a: T, b: T) -> T;
}

impl<T, F> ReduceFunction<T> for F
where
    F: Fn(T, T) -> T + Send + Sync,
{
    fn reduce(&self, a: T, b: T) -> T {
        self(a, b)
    }
}

/// Numeric types that support the four reduction operations.
pub trait Reducible: Copy + Send + Sync + 'static {
    fn combine(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn combine(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn combine(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i16, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// A [`ReduceOp`] applied to scalars.
impl<E: Reducible> ReduceFunction<E> for ReduceOp {
    fn reduce(&self, a: E, b: E) -> E {
        E::combine(a, b, *self)
    }
}

/// A [`ReduceOp`] applied element-wise to equal-length arrays. When the
/// lengths differ the longer tail is kept unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementWise(pub ReduceOp);

impl<E: Reducible> ReduceFunction<Vec<E>> for ElementWise {
    fn reduce(&self, mut a: Vec<E>, b: Vec<E>) -> Vec<E> {
        if b.len() > a.len() {
            let mut b = b;
            for (x, y) in b.iter_mut().zip(a.iter()) {
                *x = E::combine(*y, *x, self.0);
            }
            return b;
        }
        for (x, y) in a.iter_mut().zip(b) {
            *x = E::combine(*x, y, self.0);
        }
        a
    }
}
