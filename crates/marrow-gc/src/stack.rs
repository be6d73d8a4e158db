//! Conservative stack scanning.
//!
//! Spills the callee-saved registers onto the stack and reports every
//! pointer-sized word between the current stack pointer and the stack base.
//! The marker decides which of those words look like heap addresses.

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// The bottom of the stack (highest address).
    pub bottom: usize,
    /// The top of the stack (lowest address).
    pub top: usize,
}

/// Whether this target can scan its stack.
pub(crate) const IS_SUPPORTED: bool = cfg!(all(
    any(target_os = "linux", target_os = "macos", windows),
    not(miri)
));

/// Stack bounds of the current thread.
#[cfg(all(target_os = "linux", not(miri)))]
pub fn stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }
        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }
        let top = stackaddr as usize;
        Some(StackBounds {
            bottom: top + stacksize,
            top,
        })
    }
}

/// Stack bounds of the current thread.
#[cfg(all(target_os = "macos", not(miri)))]
pub fn stack_bounds() -> Option<StackBounds> {
    unsafe {
        let thread = libc::pthread_self();
        // The reported address is the high end of the stack.
        let bottom = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        Some(StackBounds {
            bottom,
            top: bottom - size,
        })
    }
}

/// Stack bounds of the current thread.
#[cfg(all(windows, not(miri)))]
pub fn stack_bounds() -> Option<StackBounds> {
    use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

    let mut low = 0usize;
    let mut high = 0usize;
    unsafe { GetCurrentThreadStackLimits(&raw mut low, &raw mut high) };
    Some(StackBounds {
        bottom: high,
        top: low,
    })
}

/// Stack bounds of the current thread.
#[cfg(any(
    miri,
    not(any(target_os = "linux", target_os = "macos", windows))
))]
pub const fn stack_bounds() -> Option<StackBounds> {
    None
}

/// Spills registers onto the stack and calls `visit` with every word from
/// the current stack pointer up to the stack base.
///
/// Does nothing if the stack bounds are unknown.
///
/// # Safety
///
/// Must run on the thread whose stack is being scanned. `visit` must not
/// dereference the words it receives without validating them first.
#[inline(never)]
pub unsafe fn spill_registers_and_scan(mut visit: impl FnMut(usize)) {
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    let mut regs = [0usize; 6];
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
        );
    }

    #[cfg(all(target_arch = "aarch64", not(miri)))]
    let mut regs = [0usize; 10];
    #[cfg(all(target_arch = "aarch64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "mov {0}, x19",
            "mov {1}, x20",
            "mov {2}, x21",
            "mov {3}, x22",
            "mov {4}, x23",
            "mov {5}, x24",
            "mov {6}, x25",
            "mov {7}, x26",
            "mov {8}, x27",
            "mov {9}, x28",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
            out(reg) regs[6],
            out(reg) regs[7],
            out(reg) regs[8],
            out(reg) regs[9],
        );
    }

    // Elsewhere the compiler spills live registers around this call anyway.
    #[cfg(any(not(any(target_arch = "x86_64", target_arch = "aarch64")), miri))]
    let regs = [0usize; 1];

    std::hint::black_box(&regs);
    for word in &regs {
        visit(*word);
    }

    let Some(bounds) = stack_bounds() else {
        return;
    };

    // The address of a local approximates the stack pointer. Stacks grow
    // downwards on every supported target.
    let sp = std::ptr::addr_of!(visit) as usize;
    let mut current = sp & !(std::mem::align_of::<usize>() - 1);
    while current < bounds.bottom {
        // SAFETY: [sp, bottom) is the live part of this thread's stack.
        let word = unsafe { std::ptr::read_volatile(current as *const usize) };
        visit(word);
        current += std::mem::size_of::<usize>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_contain_a_local() {
        if !IS_SUPPORTED {
            return;
        }
        let local = 0u64;
        let address = std::ptr::addr_of!(local) as usize;
        let bounds = stack_bounds().unwrap();
        assert!(bounds.top < address && address < bounds.bottom);
    }

    #[test]
    fn test_scan_finds_a_stack_value() {
        if !IS_SUPPORTED {
            return;
        }
        let needle = std::hint::black_box(0x5eed_cafe_usize);
        let mut found = false;
        unsafe { spill_registers_and_scan(|word| found |= word == needle) };
        std::hint::black_box(&needle);
        assert!(found);
    }
}
