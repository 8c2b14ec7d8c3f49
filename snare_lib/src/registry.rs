use std::any::TypeId;

use dashmap::DashMap;
use log::{debug, error, info, warn};

use crate::{
    abi::{ItaniumAbi, MemberAbi},
    descriptor::{HookDescriptor, HookId},
    error::{HookError, PatchError},
    hook::{Hook, HookFn, Installed},
    patch::Patcher,
    resolver::{AddressResolver, SymbolLookup},
};

/// Bookkeeping for one logical hook point.
///
/// Modelled on a resolved function: once the target is known it is
/// remembered, and once the patch is in the original entry point is too,
/// along with the function type it was installed as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookRecord {
    target_address: Option<usize>,
    original_address: Option<usize>,
    signature: Option<TypeId>,
}

impl HookRecord {
    pub fn target_address(&self) -> Option<usize> {
        self.target_address
    }

    /// Only set once the patch primitive reported success.
    pub fn is_installed(&self) -> bool {
        self.original_address.is_some()
    }
}

/// Installs hooks, each at most once.
///
/// Records are created on first use and never removed: the patches they
/// describe stay in place until the process exits.
pub struct HookRegistry<L, P, A = ItaniumAbi> {
    resolver: AddressResolver<L, A>,
    patcher: P,
    records: DashMap<HookId, HookRecord>,
}

impl<L: SymbolLookup, P: Patcher> HookRegistry<L, P> {
    pub fn new(symbols: L, patcher: P) -> Self {
        Self::with_resolver(AddressResolver::new(symbols), patcher)
    }
}

impl<L: SymbolLookup, P: Patcher, A: MemberAbi> HookRegistry<L, P, A> {
    pub fn with_resolver(resolver: AddressResolver<L, A>, patcher: P) -> Self {
        Self {
            resolver,
            patcher,
            records: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> &AddressResolver<L, A> {
        &self.resolver
    }

    pub fn record(&self, id: &HookId) -> Option<HookRecord> {
        self.records.get(id).map(|record| *record)
    }

    pub fn is_installed(&self, id: &HookId) -> bool {
        self.record(id).map_or(false, |record| record.is_installed())
    }

    /// Redirects the target `descriptor` names to `replacement` and makes
    /// the original reachable through `hook`.
    ///
    /// Installing an already installed hook point again is a successful
    /// no-op: nothing is re-resolved or re-patched. That holds across
    /// registries too, since a slot that is already bound to the same hook
    /// point is never patched again. Installing it into a second slot
    /// shares the original, provided the slot has the same function type.
    /// Failed resolution leaves the hook point untouched and can be retried
    /// later.
    ///
    /// The rewrite is not synchronised with threads that may be running the
    /// target at that moment; only the patch primitive can make the store
    /// itself atomic.
    ///
    /// # Safety
    ///
    /// The code at the resolved address must have exactly the signature and
    /// calling convention of `F`.
    pub unsafe fn install<F: HookFn>(
        &self,
        hook: &'static Hook<F>,
        descriptor: &HookDescriptor,
        replacement: F,
    ) -> Result<&'static Hook<F>, HookError> {
        let id = descriptor.id();
        if let Some(bound) = hook.id() {
            if *bound != id {
                return Err(HookError::SlotInUse {
                    bound: bound.clone(),
                    requested: id,
                });
            }
            debug!("{} is already installed", id);
            return Ok(hook);
        }

        let signature = TypeId::of::<F>();
        // Holding the entry keeps concurrent installs of the same hook point
        // waiting until this one has finished.
        let mut record = self.records.entry(id.clone()).or_default();
        if let (Some(target), Some(original)) = (record.target_address, record.original_address) {
            if record.signature != Some(signature) {
                return Err(HookError::SignatureMismatch { id });
            }
            debug!("{} is already installed, sharing its original", id);
            let installed = hook.bind_with(|| {
                Ok::<_, HookError>(Installed {
                    id: id.clone(),
                    target,
                    original: F::from_addr(original),
                })
            })?;
            return ensure_bound_to(hook, installed, id);
        }

        let target = match self.resolver.resolve(descriptor) {
            Ok(target) => target,
            Err(source) => {
                warn!("failed to look up {}, skipping hook: {}", id, source);
                return Err(HookError::ResolutionFailed { id, source });
            }
        };
        record.target_address = Some(target);

        // The patch only runs while the slot is still empty, so a slot can
        // never end up holding an original that was not its own.
        let installed = hook.bind_with(|| {
            info!("hooking {} at {:#x}...", id, target);
            let original = match self.patcher.patch(target, replacement.to_addr()) {
                Ok(0) => Err(PatchError::NullOriginal { target }),
                other => other,
            };
            match original {
                Ok(original) => Ok(Installed {
                    id: id.clone(),
                    target,
                    original: F::from_addr(original),
                }),
                Err(source) => {
                    error!("failed to patch {} at {:#x}: {}", id, target, source);
                    Err(HookError::PatchFailed {
                        id: id.clone(),
                        target,
                        source,
                    })
                }
            }
        })?;

        if installed.id == id {
            record.original_address = Some(installed.original.to_addr());
            record.signature = Some(signature);
        }
        ensure_bound_to(hook, installed, id)
    }
}

/// A slot may have been bound by another thread while we waited for it.
fn ensure_bound_to<F: HookFn>(
    hook: &'static Hook<F>,
    installed: &Installed<F>,
    id: HookId,
) -> Result<&'static Hook<F>, HookError> {
    if installed.id != id {
        return Err(HookError::SlotInUse {
            bound: installed.id.clone(),
            requested: id,
        });
    }
    Ok(hook)
}
