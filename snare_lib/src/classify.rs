use std::fmt;

/// Exposes where the primary executable image starts in memory.
pub trait ModuleBase {
    fn module_base(&self) -> usize;
}

impl ModuleBase for usize {
    fn module_base(&self) -> usize {
        *self
    }
}

/// Where an address lies relative to the module base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// `address - base`, for addresses at or above the base.
    ModuleRelative(usize),
    /// `base - address`, for code loaded below the main module.
    BeforeBase(usize),
}

/// Display bias used unless [`AddressClassifier::with_display_bias`] says
/// otherwise. Offsets render as plain offsets from the load base; pass the
/// image base of a disassembler database (e.g. `0x7100000000`) to render
/// them as that database's addresses instead.
pub const DEFAULT_DISPLAY_BIAS: u64 = 0;

/// Translates raw return addresses into offsets that stay stable across
/// runs, so they can be looked up in a disassembler.
#[derive(Debug, Clone, Copy)]
pub struct AddressClassifier {
    base: usize,
    display_bias: u64,
}

impl AddressClassifier {
    pub fn new(base: &impl ModuleBase) -> Self {
        Self {
            base: base.module_base(),
            display_bias: DEFAULT_DISPLAY_BIAS,
        }
    }

    /// Added to module-relative offsets when rendering, to match the image
    /// base a disassembler database was created with. It never affects
    /// [`classify`](Self::classify).
    pub fn with_display_bias(mut self, display_bias: u64) -> Self {
        self.display_bias = display_bias;
        self
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn classify(&self, address: usize) -> Offset {
        if address >= self.base {
            Offset::ModuleRelative(address - self.base)
        } else {
            Offset::BeforeBase(self.base - address)
        }
    }

    pub fn render(&self, address: usize) -> Rendered {
        Rendered {
            offset: self.classify(address),
            display_bias: self.display_bias,
        }
    }
}

/// Display form of an [`Offset`]: `7100001234` for module-relative
/// addresses (with the display bias applied) and `main-40` for addresses
/// below the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendered {
    offset: Offset,
    display_bias: u64,
}

impl fmt::Display for Rendered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Offset::ModuleRelative(offset) => {
                write!(f, "{:x}", (offset as u64).wrapping_add(self.display_bias))
            }
            Offset::BeforeBase(offset) => write!(f, "main-{:x}", offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x5555_0000;

    #[test]
    fn renders_plain_offsets_by_default() {
        let classifier = AddressClassifier::new(&BASE);
        assert_eq!(classifier.render(BASE + 0x40).to_string(), "40");
        assert_eq!(
            classifier.with_display_bias(0x71_0000_0000).render(BASE + 0x40).to_string(),
            "7100000040"
        );
        assert_eq!(DEFAULT_DISPLAY_BIAS, 0);
    }

    #[test]
    fn base_itself_is_offset_zero() {
        let classifier = AddressClassifier::new(&BASE);
        assert_eq!(classifier.classify(BASE), Offset::ModuleRelative(0));
    }

    #[test]
    fn one_below_base_is_before_base() {
        let classifier = AddressClassifier::new(&BASE);
        assert_eq!(classifier.classify(BASE - 1), Offset::BeforeBase(1));
    }

    #[test]
    fn bias_only_changes_rendering() {
        let classifier = AddressClassifier::new(&BASE).with_display_bias(0x71_0000_0000);
        assert_eq!(classifier.classify(BASE + 0x1234), Offset::ModuleRelative(0x1234));
        assert_eq!(classifier.render(BASE + 0x1234).to_string(), "7100001234");
        assert_eq!(classifier.render(BASE - 0x40).to_string(), "main-40");
    }

    #[test]
    fn extremes_are_classifiable() {
        let classifier = AddressClassifier::new(&BASE);
        assert_eq!(classifier.classify(0), Offset::BeforeBase(BASE));
        assert_eq!(classifier.classify(usize::MAX), Offset::ModuleRelative(usize::MAX - BASE));
    }
}
