use std::fmt;

use crate::abi::MemberFnPtr;

/// Stable identity of a logical hook point, used to key the registry.
///
/// Symbols are keyed by their name. Members are keyed by `Class::method`
/// together with the member pointer, so overloads sharing a name stay apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookId {
    name: String,
    member: Option<MemberFnPtr>,
}

impl HookId {
    pub fn symbol(name: &str) -> Self {
        Self {
            name: name.to_string(),
            member: None,
        }
    }

    pub fn member(class: &str, method: &str, member: MemberFnPtr) -> Self {
        Self {
            name: format!("{}::{}", class, method),
            member: Some(member),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn member_ptr(&self) -> Option<MemberFnPtr> {
        self.member
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member {
            Some(member) => write!(f, "{} [{:#x}, {}]", self.name, member.ptr(), member.adj()),
            None => f.write_str(&self.name),
        }
    }
}

/// Where to find the vtable a virtual member pointer indexes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtableSource(pub(crate) Source);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Instance(usize),
    Vtable(usize),
}

impl VtableSource {
    /// # Safety
    ///
    /// `object` must point to a live instance of the class whose member is
    /// being resolved, and must stay alive until resolution is done.
    pub unsafe fn instance(object: *const ()) -> Self {
        Self(Source::Instance(object as usize))
    }

    /// # Safety
    ///
    /// `vtable` must be the address point of the class's vtable, i.e. the
    /// value an instance stores in its vtable pointer.
    pub unsafe fn vtable(vtable: *const ()) -> Self {
        Self(Source::Vtable(vtable as usize))
    }
}

/// Identifies something that can be hooked.
///
/// Descriptors are plain values; nothing is resolved until the registry
/// installs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDescriptor {
    Symbol {
        name: String,
    },
    Member {
        class: String,
        method: String,
        member: MemberFnPtr,
    },
    VirtualMember {
        class: String,
        method: String,
        member: MemberFnPtr,
        /// `None` when no live instance is available yet. Resolution then
        /// fails and the hook is skipped.
        source: Option<VtableSource>,
    },
}

impl HookDescriptor {
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Symbol { name: name.into() }
    }

    pub fn member(class: impl Into<String>, method: impl Into<String>, member: MemberFnPtr) -> Self {
        Self::Member {
            class: class.into(),
            method: method.into(),
            member,
        }
    }

    pub fn virtual_member(
        class: impl Into<String>,
        method: impl Into<String>,
        member: MemberFnPtr,
        source: Option<VtableSource>,
    ) -> Self {
        Self::VirtualMember {
            class: class.into(),
            method: method.into(),
            member,
            source,
        }
    }

    pub fn id(&self) -> HookId {
        match self {
            Self::Symbol { name } => HookId::symbol(name),
            Self::Member {
                class,
                method,
                member,
            }
            | Self::VirtualMember {
                class,
                method,
                member,
                ..
            } => HookId::member(class, method, *member),
        }
    }
}
