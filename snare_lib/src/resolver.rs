use std::collections::HashMap;

use log::debug;

use crate::{
    abi::{ItaniumAbi, MemberAbi},
    descriptor::HookDescriptor,
    error::ResolveError,
};

/// Something that can map a symbol name to a runtime address.
pub trait SymbolLookup {
    fn lookup(&self, name: &str) -> Option<usize>;
}

impl<T: SymbolLookup + ?Sized> SymbolLookup for &T {
    fn lookup(&self, name: &str) -> Option<usize> {
        (**self).lookup(name)
    }
}

impl<T: SymbolLookup + ?Sized> SymbolLookup for Box<T> {
    fn lookup(&self, name: &str) -> Option<usize> {
        (**self).lookup(name)
    }
}

/// Tries each lookup in order and returns the first hit.
impl<A: SymbolLookup, B: SymbolLookup> SymbolLookup for (A, B) {
    fn lookup(&self, name: &str) -> Option<usize> {
        self.0.lookup(name).or_else(|| self.1.lookup(name))
    }
}

/// A fixed name to address table.
#[derive(Debug, Clone, Default)]
pub struct StaticSymbols(HashMap<String, usize>);

impl StaticSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, addr: usize) -> Self {
        self.insert(name, addr);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, addr: usize) {
        self.0.insert(name.into(), addr);
    }
}

impl SymbolLookup for StaticSymbols {
    fn lookup(&self, name: &str) -> Option<usize> {
        self.0.get(name).copied()
    }
}

/// Turns descriptors into the address that should be patched.
///
/// The resolver keeps no state of its own, so resolving the same descriptor
/// twice gives the same answer as long as the lookup service does.
#[derive(Debug, Clone)]
pub struct AddressResolver<L, A = ItaniumAbi> {
    symbols: L,
    abi: A,
}

impl<L: SymbolLookup> AddressResolver<L> {
    pub fn new(symbols: L) -> Self {
        Self::with_abi(symbols, ItaniumAbi)
    }
}

impl<L: SymbolLookup, A: MemberAbi> AddressResolver<L, A> {
    pub fn with_abi(symbols: L, abi: A) -> Self {
        Self { symbols, abi }
    }

    pub fn symbols(&self) -> &L {
        &self.symbols
    }

    pub fn resolve(&self, descriptor: &HookDescriptor) -> Result<usize, ResolveError> {
        let id = descriptor.id();
        let addr = match descriptor {
            HookDescriptor::Symbol { name } => self
                .symbols
                .lookup(name)
                .ok_or_else(|| ResolveError::SymbolNotFound(name.clone()))?,
            HookDescriptor::Member { member, .. } => self.abi.resolve_nonvirtual(&id, *member)?,
            HookDescriptor::VirtualMember { member, source, .. } => {
                let source = (*source).ok_or_else(|| ResolveError::MissingInstance(id.clone()))?;
                // Safety: the only way to build a `VtableSource` is through
                // its unsafe constructors, which carry the liveness contract.
                unsafe { self.abi.resolve_virtual(&id, *member, source)? }
            }
        };
        debug!("resolved {} to {:#x}", id, addr);
        Ok(addr)
    }
}
