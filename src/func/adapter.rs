//! Bridges strongly-typed Rust functions to the uniform task calling
//! convention.
//!
//! The convention is entirely type-erased: inputs arrive as a slice of
//! [`Dynamic`] and results leave through a slice of output slots. This module
//! implements [`TypedFunc`] for ordinary functions and closures of up to
//! twelve arguments. On each call the inputs are downcast to the declared
//! argument types; a wrong type fails with a [`TypeMismatch`](crate::TypeMismatch)
//! (wrapped in an `anyhow::Error`) instead of panicking.

use anyhow::Context;

use crate::core::Dynamic;

/// A function whose arguments can be recovered from type-erased inputs.
///
/// `Args` is a tuple of the argument types and only serves to keep the
/// blanket implementations apart.
pub trait TypedFunc<Args>: Send + Sync + 'static {
    /// Number of inputs the function consumes.
    fn arity(&self) -> usize;

    fn call_erased(&self, outputs: &mut [Option<Dynamic>], inputs: &[Dynamic]) -> anyhow::Result<()>;
}

fn check_arity(expected: usize, found: usize) -> anyhow::Result<()> {
    if expected != found {
        anyhow::bail!("Expected {expected} inputs, got {found}");
    }
    Ok(())
}

fn store<R>(outputs: &mut [Option<Dynamic>], result: R)
where
    R: Send + Sync + 'static,
{
    if let Some(slot) = outputs.first_mut() {
        *slot = Some(Dynamic::new(result));
    }
}

impl<Func, Ret> TypedFunc<()> for Func
where
    Func: Fn() -> Ret + Send + Sync + 'static,
    Ret: Send + Sync + 'static,
{
    fn arity(&self) -> usize {
        0
    }

    fn call_erased(&self, outputs: &mut [Option<Dynamic>], inputs: &[Dynamic]) -> anyhow::Result<()> {
        check_arity(0, inputs.len())?;
        store(outputs, (self)());
        Ok(())
    }
}

macro_rules! impl_typed {
    ($($A:ident),*) => {
        #[allow(non_snake_case)]
        impl<Func, Ret, $($A),*> TypedFunc<($($A,)*)> for Func
        where
            Func: Fn($($A),*) -> Ret + Send + Sync + 'static,
            Ret: Send + Sync + 'static,
            $($A: Clone + Send + Sync + 'static),*
        {
            fn arity(&self) -> usize {
                [$(stringify!($A)),*].len()
            }

            fn call_erased(
                &self,
                outputs: &mut [Option<Dynamic>],
                inputs: &[Dynamic],
            ) -> anyhow::Result<()> {
                check_arity(self.arity(), inputs.len())?;

                let mut iter = inputs.iter().enumerate();
                $(
                    let $A = {
                        let (index, value) = iter
                            .next()
                            .context("Input list exhausted")?;
                        value
                            .downcast_ref::<$A>()
                            .with_context(|| format!("Input {index}"))?
                            .clone()
                    };
                )*

                store(outputs, (self)($($A),*));
                Ok(())
            }
        }
    };
}

impl_typed!(A);
impl_typed!(A, B);
impl_typed!(A, B, C);
impl_typed!(A, B, C, D);
impl_typed!(A, B, C, D, E);
impl_typed!(A, B, C, D, E, F);
impl_typed!(A, B, C, D, E, F, G);
impl_typed!(A, B, C, D, E, F, G, H);
impl_typed!(A, B, C, D, E, F, G, H, I);
impl_typed!(A, B, C, D, E, F, G, H, I, J);
impl_typed!(A, B, C, D, E, F, G, H, I, J, K);
impl_typed!(A, B, C, D, E, F, G, H, I, J, K, L);
