use std::{io, path::PathBuf};

use thiserror::Error;

use crate::descriptor::HookId;

/// Reasons a [`HookDescriptor`](crate::HookDescriptor) could not be turned
/// into a code address. All of these are recoverable: the hook is skipped
/// and nothing gets patched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),
    #[error("no live instance or vtable available for {0}")]
    MissingInstance(HookId),
    #[error("vtable for {id} is unusable at {addr:#x}")]
    InvalidVtable { id: HookId, addr: usize },
    #[error("member pointer for {0} is virtual; use a virtual member descriptor")]
    VirtualWithoutInstance(HookId),
    #[error("member pointer for {0} is null")]
    NullMember(HookId),
}

/// Failures reported by a [`Patcher`](crate::Patcher).
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch primitive returned a null original for {target:#x}")]
    NullOriginal { target: usize },
    #[error("no import slot of the main image refers to {target:#x}")]
    NoImportSlot { target: usize },
    #[error("address {0:#x} is not inside any mapping")]
    Unmapped(usize),
    #[error("failed to change protection of {addr:#x}: {source}")]
    Protect {
        addr: usize,
        #[source]
        source: nix::Error,
    },
    #[error(transparent)]
    Image(#[from] ImageError),
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to resolve {id}: {source}")]
    ResolutionFailed {
        id: HookId,
        #[source]
        source: ResolveError,
    },
    #[error("failed to patch {id} at {target:#x}: {source}")]
    PatchFailed {
        id: HookId,
        target: usize,
        #[source]
        source: PatchError,
    },
    #[error("hook slot is already bound to {bound}, cannot reuse it for {requested}")]
    SlotInUse { bound: HookId, requested: HookId },
    #[error("{id} is already installed with a different signature")]
    SignatureMismatch { id: HookId },
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse elf: {0}")]
    Elf(#[from] goblin::error::Error),
    #[error("failed to query procfs: {0}")]
    Proc(#[from] procfs::ProcError),
    #[error("{0} is not mapped into the process")]
    NotMapped(PathBuf),
    #[error("{0} has no loadable segments")]
    NoLoadSegments(PathBuf),
}
