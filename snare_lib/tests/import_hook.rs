//! Hooks a libc function in this very test binary through its import slots.

use std::sync::atomic::{AtomicUsize, Ordering};

use snare_lib::{
    Backtrace, DynamicSymbols, Hook, HookDescriptor, HookError, HookRegistry, ImportPatcher,
};

static GETPID: Hook<unsafe extern "C" fn() -> libc::pid_t> = Hook::new();
static CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn getpid_replacement() -> libc::pid_t {
    CALLS.fetch_add(1, Ordering::SeqCst);
    GETPID.dispatch(|original| original())
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[test]
fn intercepts_and_forwards_getpid() {
    // Make sure the slot is bound even if the binary was linked lazily.
    let pid = unsafe { libc::getpid() };

    let registry = HookRegistry::new(DynamicSymbols, ImportPatcher::current().unwrap());
    let descriptor = HookDescriptor::symbol("getpid");
    unsafe { registry.install(&GETPID, &descriptor, getpid_replacement) }.unwrap();
    // A second install must not rewrite anything.
    unsafe { registry.install(&GETPID, &descriptor, getpid_replacement) }.unwrap();

    let before = CALLS.load(Ordering::SeqCst);
    assert_eq!(unsafe { libc::getpid() }, pid);
    assert_eq!(std::process::id(), pid as u32);
    assert!(CALLS.load(Ordering::SeqCst) >= before + 2);

    assert_eq!(GETPID.target(), Some(getpid_address()));
    assert!(!Backtrace::capture().is_empty());
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[test]
fn unknown_symbols_are_skipped() {
    static NOPE: Hook<unsafe extern "C" fn() -> libc::c_int> = Hook::new();
    unsafe extern "C" fn nope() -> libc::c_int {
        NOPE.original()()
    }

    let registry = HookRegistry::new(DynamicSymbols, ImportPatcher::current().unwrap());
    let err = unsafe { registry.install(&NOPE, &HookDescriptor::symbol("snare_not_a_symbol"), nope) }
        .unwrap_err();
    assert!(matches!(err, HookError::ResolutionFailed { .. }));
    assert!(!NOPE.is_installed());
}

fn getpid_address() -> usize {
    use snare_lib::SymbolLookup;
    DynamicSymbols.lookup("getpid").unwrap()
}
