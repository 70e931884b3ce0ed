//! x86_64 System V register-context save/restore and the copy-and-jump
//! trampoline.
//!
//! We hand-roll `setjmp`/`longjmp` instead of calling into libc's, because
//! the libc versions on some platforms also save/restore the signal mask
//! and can attempt to unwind -- the engine needs a plain register-context
//! contract: save registers, jump, nothing else. These are naked-asm
//! dock/suspend/resume primitives for the x86_64 SysV calling convention,
//! generalized from a single global dock to an arbitrary number of
//! independently capturable jump points.

use std::arch::naked_asm;

use super::super::direction;

/// A saved x86_64 SysV register context: return address, stack pointer,
/// and the six callee-saved general-purpose registers. Laid out as an
/// array of `usize` so [`save_context`]/[`restore_context`] can address
/// each slot by a fixed byte offset from naked assembly.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct JmpBuf([usize; 8]);

impl JmpBuf {
    pub const fn zeroed() -> JmpBuf {
        JmpBuf([0; 8])
    }
}

static_assertions::const_assert_eq!(std::mem::size_of::<JmpBuf>(), 8 * 8);

/// Save the calling function's register context into `buf` and return `0`.
/// When [`restore_context`] is later invoked on the same `buf`, control
/// resumes right after the `call` instruction that invoked this function,
/// as if it had returned `value` instead of `0` -- the classic
/// `setjmp`/`longjmp` contract, `#[unsafe(naked)]` so the compiler never
/// assumes this call returns exactly once.
///
/// ## Safety
/// `buf` must be valid for writes of `size_of::<JmpBuf>()` bytes. The stack
/// frame live at the call site must still be live (not yet unwound) at the
/// time a corresponding `restore_context` call is made.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn save_context(buf: *mut JmpBuf) -> i32 {
    naked_asm!(
        "mov rax, [rsp]",    // return address
        "mov [rdi], rax",    // buf.rip
        "lea rax, [rsp + 8]", // caller's rsp once this call returns
        "mov [rdi + 8], rax", // buf.rsp
        "mov [rdi + 16], rbx",
        "mov [rdi + 24], rbp",
        "mov [rdi + 32], r12",
        "mov [rdi + 40], r13",
        "mov [rdi + 48], r14",
        "mov [rdi + 56], r15",
        "xor eax, eax",
        "ret",
    )
}

/// Restore the register context saved in `buf` and jump to it, making the
/// matching [`save_context`] call site observe `value` as its return value.
/// Never returns to its own caller.
///
/// ## Safety
/// `buf` must have been populated by `save_context`, and the stack region
/// its saved `rsp` points into must already hold the bytes that were live
/// at capture time (restored by the caller, e.g. via [`jump_to`]) before
/// this is called.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn restore_context(buf: *const JmpBuf, value: i32) -> ! {
    naked_asm!(
        "mov eax, esi",
        "mov rbx, [rdi + 16]",
        "mov rbp, [rdi + 24]",
        "mov r12, [rdi + 32]",
        "mov r13, [rdi + 40]",
        "mov r14, [rdi + 48]",
        "mov r15, [rdi + 56]",
        "mov rcx, [rdi + 8]", // new rsp
        "mov rdx, [rdi]",     // new rip
        "mov rsp, rcx",
        "jmp rdx",
    )
}

/// Dynamically extend the current stack by `extra` bytes (the naked-asm
/// analogue of `alloca`, which Rust has no safe equivalent of), then tail
/// into [`copy_then_restore`] with the remaining arguments shifted down one
/// register. The extension guarantees the upcoming memcpy in
/// `copy_then_restore` writes into memory strictly below our current frame,
/// so it can never clobber the very locals performing the copy.
///
/// ## Safety
/// `extra` must be large enough to cover `size` bytes at `base` plus
/// headroom for `copy_then_restore`'s own frame (see [`jump_to`]).
#[unsafe(naked)]
unsafe extern "C" fn extend_stack_and_copy(
    extra: usize,
    bytes: *const u8,
    size: usize,
    base: *mut u8,
    buf: *const JmpBuf,
    value: i32,
) -> ! {
    naked_asm!(
        "sub rsp, rdi",
        "and rsp, -16",
        "mov rdi, rsi",
        "mov rsi, rdx",
        "mov rdx, rcx",
        "mov rcx, r8",
        "mov r8d, r9d",
        "jmp {helper}",
        helper = sym copy_then_restore,
    )
}

/// Copy `size` bytes from `bytes` to `base`, then restore `buf`'s context
/// with `value`. Ordinary (non-naked) function: by the time it runs, the
/// stack beneath it has already been pushed down by
/// [`extend_stack_and_copy`], so this frame and the memcpy destination
/// cannot overlap.
unsafe extern "C" fn copy_then_restore(
    bytes: *const u8,
    size: usize,
    base: *mut u8,
    buf: *const JmpBuf,
    value: i32,
) -> ! {
    if size > 0 {
        unsafe {
            std::ptr::copy_nonoverlapping(bytes, base, size);
        }
    }
    unsafe { restore_context(buf, value) }
}

/// Headroom added on top of the captured region's own size when extending
/// the stack before a restoring jump: room for `copy_then_restore`'s frame
/// and the red zone. The original gives itself `0x200`; we're a little more
/// generous since our helper additionally takes a `call`-sized frame.
const JUMP_STACK_MARGIN: usize = 0x400;

/// Jump to `entry`, first restoring `bytes`/`size` at `base` if non-empty.
/// Mirrors `jumpto`: if there is no captured stack, a direct
/// `restore_context` suffices; otherwise the current stack is grown by
/// `alloca`-equivalent means so the restoring memcpy runs strictly above
/// the region it's about to overwrite.
///
/// ## Safety
/// Same preconditions as [`restore_context`], plus: if `base`/`size`
/// describe a non-empty region, that region must be valid for the
/// remainder of this thread's stack usage once restored (i.e. `entry` must
/// genuinely belong to a still-live dynamic extent at that address range).
pub(crate) unsafe fn jump_to(bytes: Option<*const u8>, size: isize, base: *const u8, entry: *const JmpBuf, value: i32) -> ! {
    match bytes {
        None => {
            // No stack to restore; just jump back down. Sanity-check we are
            // not jumping "up" to a scope that has already exited.
            if !base.is_null() {
                let top = direction::current_top();
                let region_top = direction::region_top(base, size);
                if direction::is_below(top, region_top) {
                    crate::error::fatal(crate::error::EngineError::StackDirectionViolation);
                }
            }
            unsafe { restore_context(entry, value) }
        }
        Some(bytes) => {
            let top = direction::current_top();
            let region_top = direction::region_top(base, size);
            let extra = direction::diff(region_top, top).max(0) as usize + JUMP_STACK_MARGIN;
            unsafe {
                extend_stack_and_copy(extra, bytes, size as usize, base as *mut u8, entry, value)
            }
        }
    }
}
