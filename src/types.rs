//! Function-pointer types at the JIT boundary.
//!
//! Every user symbol added through [`crate::codegen::CodeGen`] produces
//! up to three entry points sharing the symbol's base name:
//!
//! - the varargs entry `name`: one `f64` argument per free variable, in
//!   sorted order;
//! - the packed entry `name.vecargs`: a single pointer to a packed `f64`
//!   array;
//! - the batched entry `name.batch`: an output/input pointer pair looped
//!   `batch_size` times.
//!
//! Taylor steppers use a fourth shape: state pointer, timestep, order.
//!
//! All pointers are raw and the calls are `unsafe`: the caller promises
//! the pointed-to arrays are large enough and remain valid for the call.

/// Packed entry: reads the variables from a pointer to a packed `f64`
/// array and returns the expression value.
pub type PackedFn = unsafe extern "C" fn(*const f64) -> f64;

/// Batched entry: fills `out[i]` from `n_vars` packed doubles at
/// `in + i * n_vars`, for `i` in `[0, batch_size)`.
pub type BatchFn = unsafe extern "C" fn(*mut f64, *const f64);

/// Taylor stepper entry: advances the state vector behind the pointer by
/// one step of timestep `h` and the given order.
pub type TaylorFn = unsafe extern "C" fn(*mut f64, f64, u32);

mod sealed {
    pub trait Sealed {}
}

/// A varargs entry-point shape: `extern "C" fn(f64, ..., f64) -> f64`
/// with a compile-time arity.
///
/// Implemented for function-pointer types up to ten arguments; the
/// recorded variable count of a symbol is checked against
/// [`VarargFn::ARITY`] when fetching.
///
/// # Safety
///
/// Implementations must be plain `extern "C"` function-pointer types
/// whose every parameter is `f64` and whose return type is `f64`, so
/// that transmuting a JIT entry address into them is sound.
pub unsafe trait VarargFn: Copy + sealed::Sealed {
    /// Number of `f64` arguments the function pointer takes.
    const ARITY: usize;

    /// Reinterprets a finalized JIT entry address as this pointer type.
    ///
    /// # Safety
    ///
    /// `ptr` must be the address of a finalized function whose signature
    /// is exactly `ARITY` doubles to one double.
    unsafe fn from_raw(ptr: *const u8) -> Self;
}

macro_rules! impl_vararg_fn {
    ($arity:literal, $($arg:ident),+) => {
        impl sealed::Sealed for unsafe extern "C" fn($($arg),+) -> f64 {}

        unsafe impl VarargFn for unsafe extern "C" fn($($arg),+) -> f64 {
            const ARITY: usize = $arity;

            unsafe fn from_raw(ptr: *const u8) -> Self {
                std::mem::transmute(ptr)
            }
        }
    };
}

impl_vararg_fn!(1, f64);
impl_vararg_fn!(2, f64, f64);
impl_vararg_fn!(3, f64, f64, f64);
impl_vararg_fn!(4, f64, f64, f64, f64);
impl_vararg_fn!(5, f64, f64, f64, f64, f64);
impl_vararg_fn!(6, f64, f64, f64, f64, f64, f64);
impl_vararg_fn!(7, f64, f64, f64, f64, f64, f64, f64);
impl_vararg_fn!(8, f64, f64, f64, f64, f64, f64, f64, f64);
impl_vararg_fn!(9, f64, f64, f64, f64, f64, f64, f64, f64, f64);
impl_vararg_fn!(10, f64, f64, f64, f64, f64, f64, f64, f64, f64, f64);
