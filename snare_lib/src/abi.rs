//! Itanium C++ ABI pointer-to-member-function decoding.
//!
//! This is the only place that reinterprets member pointer bits. A member
//! function pointer is two words, `{ ptr, adj }`, but the two ABI variants
//! disagree on where the "virtual" flag lives:
//!
//! * generic (x86, x86_64): `ptr` is odd for virtual members, and
//!   `ptr - 1` is the byte offset of the slot inside the vtable. `adj` is
//!   the `this` adjustment in bytes.
//! * ARM (arm, aarch64): `ptr` is either the code address or the vtable
//!   byte offset, and the low bit of `adj` is the virtual flag. The `this`
//!   adjustment is `adj >> 1`.
//!
//! Any other target gets no decoding at all and every member resolution
//! fails to compile, rather than silently producing wrong addresses.

use std::mem;

use crate::{
    descriptor::{HookId, Source, VtableSource},
    error::ResolveError,
};

const WORD: usize = mem::size_of::<usize>();

/// Raw pointer-to-member-function, laid out exactly as the C++ compiler
/// stores it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberFnPtr {
    ptr: usize,
    adj: isize,
}

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        impl MemberFnPtr {
            pub fn is_virtual(&self) -> bool {
                self.ptr & 1 == 1
            }

            pub fn this_adjustment(&self) -> isize {
                self.adj
            }

            pub fn vtable_offset(&self) -> Option<usize> {
                self.is_virtual().then(|| self.ptr - 1)
            }

            /// Encodes a virtual member living in vtable slot `index`.
            pub fn virtual_slot(index: usize) -> Self {
                Self { ptr: index * WORD + 1, adj: 0 }
            }
        }
    } else if #[cfg(any(target_arch = "arm", target_arch = "aarch64"))] {
        impl MemberFnPtr {
            pub fn is_virtual(&self) -> bool {
                self.adj & 1 == 1
            }

            pub fn this_adjustment(&self) -> isize {
                self.adj >> 1
            }

            pub fn vtable_offset(&self) -> Option<usize> {
                self.is_virtual().then(|| self.ptr)
            }

            /// Encodes a virtual member living in vtable slot `index`.
            pub fn virtual_slot(index: usize) -> Self {
                Self { ptr: index * WORD, adj: 1 }
            }
        }
    } else {
        compile_error!("member pointer decoding is only implemented for the Itanium ABI on x86 and ARM");
    }
}

impl MemberFnPtr {
    pub fn ptr(&self) -> usize {
        self.ptr
    }

    pub fn adj(&self) -> isize {
        self.adj
    }

    /// Wraps the two words of a member pointer as produced by the compiler,
    /// e.g. handed over from C++ through FFI.
    pub const fn from_raw(ptr: usize, adj: isize) -> Self {
        Self { ptr, adj }
    }

    /// A non-virtual member whose body lives at `addr`.
    pub const fn non_virtual(addr: usize) -> Self {
        Self { ptr: addr, adj: 0 }
    }

    /// The code address of a non-virtual member. For non-virtual members the
    /// first word *is* the entry point on both ABI variants.
    pub fn code_address(&self) -> Option<usize> {
        (!self.is_virtual() && self.ptr != 0).then(|| self.ptr)
    }
}

/// Capability to turn member pointers into entry points.
pub trait MemberAbi {
    fn resolve_nonvirtual(&self, id: &HookId, member: MemberFnPtr) -> Result<usize, ResolveError>;

    /// # Safety
    ///
    /// `source` must refer to a live object (or vtable) of the class that
    /// `member` belongs to; its memory is read.
    unsafe fn resolve_virtual(
        &self,
        id: &HookId,
        member: MemberFnPtr,
        source: VtableSource,
    ) -> Result<usize, ResolveError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ItaniumAbi;

impl MemberAbi for ItaniumAbi {
    fn resolve_nonvirtual(&self, id: &HookId, member: MemberFnPtr) -> Result<usize, ResolveError> {
        if member.is_virtual() {
            return Err(ResolveError::VirtualWithoutInstance(id.clone()));
        }
        member
            .code_address()
            .ok_or_else(|| ResolveError::NullMember(id.clone()))
    }

    unsafe fn resolve_virtual(
        &self,
        id: &HookId,
        member: MemberFnPtr,
        source: VtableSource,
    ) -> Result<usize, ResolveError> {
        let offset = match member.vtable_offset() {
            Some(offset) => offset,
            // The compiler hands out plain addresses for final or
            // non-virtual overloads even through a "virtual" descriptor.
            None => return self.resolve_nonvirtual(id, member),
        };

        let vtable = match source.0 {
            Source::Instance(object) => {
                let this = (object as isize).wrapping_add(member.this_adjustment()) as usize;
                read_word(this).ok_or_else(|| ResolveError::InvalidVtable {
                    id: id.clone(),
                    addr: this,
                })?
            }
            Source::Vtable(vtable) => vtable,
        };

        let slot = vtable
            .checked_add(offset)
            .ok_or_else(|| ResolveError::InvalidVtable {
                id: id.clone(),
                addr: vtable,
            })?;
        read_word(slot).ok_or_else(|| ResolveError::InvalidVtable {
            id: id.clone(),
            addr: slot,
        })
    }
}

/// Reads a non-null word from `addr`. Null and misaligned addresses are
/// rejected before the read.
unsafe fn read_word(addr: usize) -> Option<usize> {
    if addr == 0 || addr % WORD != 0 {
        return None;
    }
    let value = (addr as *const usize).read();
    (value != 0).then(|| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> HookId {
        HookId::member("Widget", "draw", MemberFnPtr::non_virtual(0x4000))
    }

    extern "C" fn slot_zero() {}
    extern "C" fn slot_one() {}

    #[repr(C)]
    struct Object {
        vptr: *const usize,
        _payload: u64,
    }

    #[test]
    fn non_virtual_is_its_own_address() {
        let member = MemberFnPtr::non_virtual(0x4000);
        assert!(!member.is_virtual());
        assert_eq!(ItaniumAbi.resolve_nonvirtual(&id(), member), Ok(0x4000));
    }

    #[test]
    fn null_non_virtual_is_rejected() {
        assert_eq!(
            ItaniumAbi.resolve_nonvirtual(&id(), MemberFnPtr::non_virtual(0)),
            Err(ResolveError::NullMember(id()))
        );
    }

    #[test]
    fn virtual_member_needs_an_instance() {
        assert_eq!(
            ItaniumAbi.resolve_nonvirtual(&id(), MemberFnPtr::virtual_slot(1)),
            Err(ResolveError::VirtualWithoutInstance(id()))
        );
    }

    #[test]
    fn virtual_slot_is_read_through_the_instance() {
        let vtable = [slot_zero as usize, slot_one as usize];
        let object = Object {
            vptr: vtable.as_ptr(),
            _payload: 7,
        };
        let source = unsafe { VtableSource::instance(&object as *const Object as *const ()) };

        let resolved = unsafe {
            ItaniumAbi.resolve_virtual(&id(), MemberFnPtr::virtual_slot(1), source)
        };
        assert_eq!(resolved, Ok(slot_one as usize));
    }

    #[test]
    fn virtual_slot_is_read_through_a_vtable() {
        let vtable = [slot_zero as usize, slot_one as usize];
        let source = unsafe { VtableSource::vtable(vtable.as_ptr() as *const ()) };

        let resolved = unsafe {
            ItaniumAbi.resolve_virtual(&id(), MemberFnPtr::virtual_slot(0), source)
        };
        assert_eq!(resolved, Ok(slot_zero as usize));
    }

    #[test]
    fn empty_vtable_slot_is_invalid() {
        let vtable = [slot_zero as usize, 0];
        let source = unsafe { VtableSource::vtable(vtable.as_ptr() as *const ()) };

        let resolved = unsafe {
            ItaniumAbi.resolve_virtual(&id(), MemberFnPtr::virtual_slot(1), source)
        };
        assert!(matches!(resolved, Err(ResolveError::InvalidVtable { .. })));
    }
}
