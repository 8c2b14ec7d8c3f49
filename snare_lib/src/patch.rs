//! Patch primitives.
//!
//! The registry only needs something that redirects `target` to
//! `replacement` and hands back an entry point for the untouched original.
//! Rewriting instruction bytes is left to external primitives;
//! [`ImportPatcher`] is the one implementation shipped here, and it never
//! touches code: it redirects the main image's import slots instead.

use std::{
    ffi::c_void,
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, info};
use nix::{
    sys::mman::{mprotect, ProtFlags},
    unistd::{sysconf, SysconfVar},
};
use procfs::process::{MemoryMap, Process};

use crate::{
    error::{ImageError, PatchError},
    image::ProcessImage,
};

const WORD: usize = mem::size_of::<usize>();
const FALLBACK_PAGE_SIZE: usize = 0x1000;

pub trait Patcher {
    /// Redirects calls to `target` into `replacement` and returns the
    /// address that still runs the original implementation.
    ///
    /// Other threads may be executing `target` while the patch goes in.
    /// Implementations must make the rewrite itself visible atomically, but
    /// nothing here can stop a thread that is already past the patched
    /// point.
    ///
    /// # Safety
    ///
    /// `replacement` must have the same signature and calling convention as
    /// the code at `target`.
    unsafe fn patch(&self, target: usize, replacement: usize) -> Result<usize, PatchError>;
}

impl<P: Patcher + ?Sized> Patcher for &P {
    unsafe fn patch(&self, target: usize, replacement: usize) -> Result<usize, PatchError> {
        (**self).patch(target, replacement)
    }
}

/// Redirects a function by rewriting every import slot (`JUMP_SLOT` and
/// `GLOB_DAT` relocations) of the main image that currently holds it.
///
/// The function body stays intact, so the "original" handed back is the
/// target itself. Only calls made through the rewritten slots are
/// intercepted; code that calls the function directly is unaffected.
#[derive(Debug, Clone)]
pub struct ImportPatcher {
    slots: Vec<usize>,
}

impl ImportPatcher {
    pub fn current() -> Result<Self, ImageError> {
        Ok(Self::for_image(&ProcessImage::current()?))
    }

    /// Only meaningful for the image of the calling process.
    pub fn for_image(image: &ProcessImage) -> Self {
        Self::from_slots(image.import_slots().to_vec())
    }

    pub fn from_slots(slots: Vec<usize>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[usize] {
        &self.slots
    }
}

impl Patcher for ImportPatcher {
    unsafe fn patch(&self, target: usize, replacement: usize) -> Result<usize, PatchError> {
        let matching = self
            .slots
            .iter()
            .copied()
            .filter(|slot| slot % WORD == 0)
            .filter(|&slot| (*(slot as *const AtomicUsize)).load(Ordering::Acquire) == target)
            .collect::<Vec<_>>();
        if matching.is_empty() {
            return Err(PatchError::NoImportSlot { target });
        }

        // Reading procfs may itself go through the slots being rewritten, so
        // every protection is looked up before the first write.
        let maps = current_mappings()?;
        let protections = matching
            .iter()
            .map(|&slot| protection_of(&maps, slot))
            .collect::<Result<Vec<_>, _>>()?;

        for (&slot, prot) in matching.iter().zip(protections) {
            swap_slot(slot, replacement, prot)?;
            debug!("import slot {:#x}: {:#x} -> {:#x}", slot, target, replacement);
        }
        info!("redirected {} import slot(s) of {:#x}", matching.len(), target);
        Ok(target)
    }
}

/// Atomically replaces the word at `slot` and returns the previous value.
///
/// Read-only mappings are made writable for the duration of the store and
/// then put back to the protection procfs reported for them.
///
/// # Safety
///
/// `slot` must be a word-aligned pointer slot that nothing else rewrites
/// concurrently.
pub unsafe fn write_slot(slot: usize, value: usize) -> Result<usize, PatchError> {
    let prot = protection_of(&current_mappings()?, slot)?;
    swap_slot(slot, value, prot)
}

unsafe fn swap_slot(slot: usize, value: usize, prot: ProtFlags) -> Result<usize, PatchError> {
    let cell = &*(slot as *const AtomicUsize);
    if prot.contains(ProtFlags::PROT_WRITE) {
        return Ok(cell.swap(value, Ordering::AcqRel));
    }

    let page = page_size();
    // An aligned word never straddles a page boundary.
    let page_start = (slot & !(page - 1)) as *mut c_void;
    mprotect(page_start, page, prot | ProtFlags::PROT_WRITE)
        .map_err(|source| PatchError::Protect { addr: slot, source })?;
    let previous = cell.swap(value, Ordering::AcqRel);
    mprotect(page_start, page, prot).map_err(|source| PatchError::Protect { addr: slot, source })?;
    Ok(previous)
}

fn current_mappings() -> Result<Vec<MemoryMap>, PatchError> {
    Ok(Process::myself()
        .and_then(|process| process.maps())
        .map_err(ImageError::from)?)
}

fn protection_of(maps: &[MemoryMap], addr: usize) -> Result<ProtFlags, PatchError> {
    let map = maps
        .iter()
        .find(|map| map.address.0 as usize <= addr && addr < map.address.1 as usize)
        .ok_or(PatchError::Unmapped(addr))?;

    let mut prot = ProtFlags::PROT_NONE;
    for (flag, bit) in [
        ('r', ProtFlags::PROT_READ),
        ('w', ProtFlags::PROT_WRITE),
        ('x', ProtFlags::PROT_EXEC),
    ] {
        if map.perms.contains(flag) {
            prot |= bit;
        }
    }
    Ok(prot)
}

pub(crate) fn page_size() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|size| size as usize)
        .unwrap_or(FALLBACK_PAGE_SIZE)
}
