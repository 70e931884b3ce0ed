//! Architecture-specific jump-trampoline primitives.
//!
//! This is the one module that reaches for inline assembly; everything
//! above it (cstack, hstack, fragment, resumption, engine) is ordinary
//! safe-adjacent Rust operating on bytes this module produces and
//! consumes. This commits to a single concrete architecture rather than an
//! abstract one, and refuses to build on anything else.

#[cfg(all(target_arch = "x86_64", target_family = "unix"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", target_family = "unix"))]
pub(crate) use x86_64::*;

#[cfg(not(all(target_arch = "x86_64", target_family = "unix")))]
compile_error!("effection currently only supports x86_64 on unix-family targets");
