//! Typed forwarding slots for installed hooks.
//!
//! A replacement function has no way to reach the original implementation
//! except through some global, so each hook point gets a `static Hook<F>`
//! that the registry fills in once the patch is in place:
//!
//! ```ignore
//! static SAVE: Hook<extern "C" fn(*mut Report) -> u32> = Hook::new();
//!
//! extern "C" fn save(report: *mut Report) -> u32 {
//!     log_report(report);
//!     SAVE.original()(report)
//! }
//!
//! unsafe { registry.install(&SAVE, &HookDescriptor::symbol("report_save"), save)? };
//! ```

use std::fmt;

use log::trace;
use once_cell::sync::OnceCell;

use crate::descriptor::HookId;

/// Function pointer types that can be installed as hooks.
///
/// # Safety
///
/// Implementors must be plain, pointer-sized function pointers so that the
/// address round-trip through `usize` is lossless.
pub unsafe trait HookFn: Copy + Send + Sync + 'static {
    fn to_addr(self) -> usize;

    /// # Safety
    ///
    /// `addr` must be non-null and point at code with exactly this signature
    /// and calling convention.
    unsafe fn from_addr(addr: usize) -> Self;
}

macro_rules! impl_hook_fn {
    (@emit $ty:ty; $($arg:ident),*) => {
        unsafe impl<R: 'static, $($arg: 'static),*> HookFn for $ty {
            fn to_addr(self) -> usize {
                self as usize
            }

            unsafe fn from_addr(addr: usize) -> Self {
                std::mem::transmute::<usize, Self>(addr)
            }
        }
    };
    ($($arg:ident),*) => {
        impl_hook_fn!(@emit fn($($arg),*) -> R; $($arg),*);
        impl_hook_fn!(@emit unsafe fn($($arg),*) -> R; $($arg),*);
        impl_hook_fn!(@emit extern "C" fn($($arg),*) -> R; $($arg),*);
        impl_hook_fn!(@emit unsafe extern "C" fn($($arg),*) -> R; $($arg),*);
    };
}

impl_hook_fn!();
impl_hook_fn!(A);
impl_hook_fn!(A, B);
impl_hook_fn!(A, B, C);
impl_hook_fn!(A, B, C, D);
impl_hook_fn!(A, B, C, D, E);
impl_hook_fn!(A, B, C, D, E, F);

pub(crate) struct Installed<F> {
    pub(crate) id: HookId,
    pub(crate) target: usize,
    pub(crate) original: F,
}

/// The forwarding slot of one hook point.
///
/// It starts out empty and is filled exactly once, by
/// [`HookRegistry::install`](crate::HookRegistry::install).
pub struct Hook<F: HookFn> {
    installed: OnceCell<Installed<F>>,
}

impl<F: HookFn> Hook<F> {
    pub const fn new() -> Self {
        Self {
            installed: OnceCell::new(),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed.get().is_some()
    }

    pub fn id(&self) -> Option<&HookId> {
        self.installed.get().map(|installed| &installed.id)
    }

    /// The patched address.
    pub fn target(&self) -> Option<usize> {
        self.installed.get().map(|installed| installed.target)
    }

    /// The original implementation, callable with the hooked signature.
    ///
    /// # Panics
    ///
    /// If the hook was never installed. A replacement can only run after its
    /// patch went in, so reaching this means the hook pipeline is broken and
    /// there is nothing sensible to forward to.
    pub fn original(&self) -> F {
        match self.installed.get() {
            Some(installed) => installed.original,
            None => panic!("forwarding through a hook that was never installed"),
        }
    }

    /// Forwards to the original, letting `forward` observe or adjust the
    /// call around it.
    pub fn dispatch<R>(&self, forward: impl FnOnce(F) -> R) -> R {
        let original = self.original();
        if let Some(id) = self.id() {
            trace!("forwarding {}", id);
        }
        forward(original)
    }

    /// Fills an empty slot with whatever `install` produces. `install` only
    /// runs while the slot is empty and concurrent callers wait for it, so
    /// a slot is filled at most once. An error leaves the slot empty.
    pub(crate) fn bind_with<E>(
        &self,
        install: impl FnOnce() -> Result<Installed<F>, E>,
    ) -> Result<&Installed<F>, E> {
        self.installed.get_or_try_init(install)
    }
}

impl<F: HookFn> fmt::Debug for Hook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.installed.get() {
            Some(installed) => f
                .debug_struct("Hook")
                .field("id", &installed.id)
                .field("target", &format_args!("{:#x}", installed.target))
                .finish(),
            None => f.write_str("Hook(<not installed>)"),
        }
    }
}

impl<F: HookFn> Default for Hook<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_one(x: u32) -> u32 {
        x + 1
    }

    extern "C" fn sum(a: u64, b: u64, c: u64) -> u64 {
        a + b + c
    }

    #[test]
    fn addresses_round_trip() {
        let f: fn(u32) -> u32 = add_one;
        let back = unsafe { <fn(u32) -> u32 as HookFn>::from_addr(f.to_addr()) };
        assert_eq!(back(4), 5);

        let g: extern "C" fn(u64, u64, u64) -> u64 = sum;
        let back = unsafe { <extern "C" fn(u64, u64, u64) -> u64 as HookFn>::from_addr(g.to_addr()) };
        assert_eq!(back(1, 2, 3), 6);
    }

    fn installed(name: &str, target: usize) -> Result<Installed<fn(u32) -> u32>, ()> {
        Ok(Installed {
            id: HookId::symbol(name),
            target,
            original: add_one,
        })
    }

    #[test]
    fn slots_fill_once() {
        let hook: Hook<fn(u32) -> u32> = Hook::new();
        assert!(!hook.is_installed());
        hook.bind_with(|| installed("add_one", 0x1000)).unwrap();
        let bound = hook.bind_with(|| installed("other", 0x2000)).unwrap();
        assert_eq!(bound.id, HookId::symbol("add_one"));

        assert_eq!(hook.id(), Some(&HookId::symbol("add_one")));
        assert_eq!(hook.target(), Some(0x1000));
        assert_eq!(hook.original()(1), 2);
    }

    #[test]
    fn failed_binds_leave_the_slot_empty() {
        let hook: Hook<fn(u32) -> u32> = Hook::new();
        let failed = hook.bind_with(|| Err::<Installed<_>, _>("patch failed"));
        assert_eq!(failed.err(), Some("patch failed"));
        assert!(!hook.is_installed());
        hook.bind_with(|| installed("add_one", 0x1000)).unwrap();
        assert!(hook.is_installed());
    }

    #[test]
    fn dispatch_wraps_the_original() {
        let hook: Hook<fn(u32) -> u32> = Hook::new();
        hook.bind_with(|| installed("add_one", 0x1000)).unwrap();
        assert_eq!(hook.dispatch(|original| original(3) * 2), 8);
    }

    #[test]
    fn debug_shows_the_binding() {
        let hook: Hook<fn(u32) -> u32> = Hook::new();
        assert_eq!(format!("{:?}", hook), "Hook(<not installed>)");
        hook.bind_with(|| installed("add_one", 0x1000)).unwrap();
        assert_eq!(
            format!("{:?}", hook),
            r#"Hook { id: HookId { name: "add_one", member: None }, target: 0x1000 }"#
        );
    }

    #[test]
    #[should_panic(expected = "never installed")]
    fn forwarding_an_empty_slot_is_fatal() {
        let hook: Hook<fn(u32) -> u32> = Hook::new();
        hook.original();
    }
}
