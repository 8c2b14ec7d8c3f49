use std::ffi::CString;

use crate::resolver::SymbolLookup;

/// Asks the dynamic linker, searching every object loaded into the process
/// in load order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicSymbols;

impl SymbolLookup for DynamicSymbols {
    fn lookup(&self, name: &str) -> Option<usize> {
        let name = CString::new(name).ok()?;
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        (!addr.is_null()).then(|| addr as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_libc_functions() {
        assert!(DynamicSymbols.lookup("getpid").is_some());
    }

    #[test]
    fn unknown_names_are_none() {
        assert_eq!(DynamicSymbols.lookup("snare_no_such_symbol_anywhere"), None);
        assert_eq!(DynamicSymbols.lookup("embedded\0nul"), None);
    }
}
