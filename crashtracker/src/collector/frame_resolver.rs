// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack walking and symbol lookup for the crash handler.
//!
//! Walking uses `backtrace::trace_unsynchronized`, which only reads unwind tables and the
//! stack. Symbolication is split in two: [`SymbolTable::load_current_process`] does all of the
//! expensive work (reading ELF files, demangling, allocating) at startup, and
//! [`SymbolTable::lookup`] is a binary search over the result, which is safe to run inside a
//! signal handler.

use crate::shared::configuration::ResolveFrames;

/// Addresses of a single frame exactly as the unwinder reported them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub ip: usize,
    pub sp: usize,
    pub symbol_address: usize,
}

impl RawFrame {
    pub const EMPTY: RawFrame = RawFrame {
        ip: 0,
        sp: 0,
        symbol_address: 0,
    };
}

/// A symbol borrowed from a [`SymbolTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRef<'a> {
    pub address: usize,
    pub name: &'a str,
    pub module: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub raw: RawFrame,
    pub symbol: Option<SymbolRef<'a>>,
}

impl Frame<'_> {
    pub const EMPTY: Frame<'static> = Frame {
        raw: RawFrame::EMPTY,
        symbol: None,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Absolute (load-bias adjusted) start address.
    pub address: usize,
    /// Zero when the object file didn't record a size.
    pub size: usize,
    pub name: Box<str>,
    /// Index into [`SymbolTable::modules`].
    pub module: usize,
}

/// Function symbols of every object mapped into the process, sorted by address.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    modules: Vec<Box<str>>,
}

impl SymbolTable {
    pub fn new(modules: Vec<Box<str>>, mut symbols: Vec<Symbol>) -> Self {
        symbols.retain(|s| s.module < modules.len());
        // Sized symbols first at any given address, so aliases don't hide the size.
        symbols.sort_by(|a, b| a.address.cmp(&b.address).then(b.size.cmp(&a.size)));
        symbols.dedup_by_key(|s| s.address);
        symbols.shrink_to_fit();
        Self { symbols, modules }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn modules(&self) -> &[Box<str>] {
        &self.modules
    }

    /// Finds the function containing `addr`.
    ///
    /// A symbol without a recorded size is assumed to extend up to the next symbol of the same
    /// module.
    /// SIGNAL SAFETY:
    ///     Binary search over already-built vectors, no allocation.
    pub fn lookup(&self, addr: usize) -> Option<SymbolRef<'_>> {
        let idx = self.symbols.partition_point(|s| s.address <= addr);
        let candidate = self.symbols.get(idx.checked_sub(1)?)?;
        let contains = if candidate.size > 0 {
            addr - candidate.address < candidate.size
        } else {
            self.symbols
                .get(idx)
                .is_some_and(|next| next.module == candidate.module)
        };
        if !contains {
            return None;
        }
        Some(SymbolRef {
            address: candidate.address,
            name: &candidate.name,
            module: self.modules.get(candidate.module).map_or("", |m| m),
        })
    }
}

#[cfg(target_os = "linux")]
mod load {
    use super::{Symbol, SymbolTable};
    use anyhow::Context;
    use goblin::elf::{sym::Symtab, Elf};
    use goblin::strtab::Strtab;
    use std::ffi::{CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;
    use std::path::PathBuf;
    use symbolic_common::Name;
    use symbolic_demangle::{Demangle, DemangleOptions};

    struct LoadedObject {
        path: PathBuf,
        bias: usize,
    }

    unsafe extern "C" fn push_object(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        // SAFETY: `data` is the `Vec` passed to `dl_iterate_phdr` below, `info` is provided by
        // the loader for the duration of the callback.
        let (objects, info) = unsafe { (&mut *(data as *mut Vec<LoadedObject>), &*info) };
        let name = if info.dlpi_name.is_null() {
            &[][..]
        } else {
            unsafe { CStr::from_ptr(info.dlpi_name) }.to_bytes()
        };
        let path = if !name.is_empty() {
            PathBuf::from(OsStr::from_bytes(name))
        } else if objects.is_empty() {
            // The main program is reported first, without a name.
            PathBuf::from("/proc/self/exe")
        } else {
            return 0;
        };
        objects.push(LoadedObject {
            path,
            bias: info.dlpi_addr as usize,
        });
        0
    }

    fn loaded_objects() -> Vec<LoadedObject> {
        let mut objects: Vec<LoadedObject> = Vec::new();
        // SAFETY: the callback only touches `objects`, which outlives the call.
        unsafe {
            libc::dl_iterate_phdr(
                Some(push_object),
                &mut objects as *mut Vec<LoadedObject> as *mut libc::c_void,
            );
        }
        objects
    }

    fn demangle(raw: &str) -> Box<str> {
        match Name::from(raw).demangle(DemangleOptions::name_only()) {
            Some(demangled) => demangled.into_boxed_str(),
            None => raw.into(),
        }
    }

    fn push_functions(
        symbols: &mut Vec<Symbol>,
        syms: &Symtab,
        strtab: &Strtab,
        bias: usize,
        module: usize,
    ) {
        for sym in syms.iter() {
            if !sym.is_function() || sym.st_value == 0 || sym.st_shndx == 0 {
                continue;
            }
            let Some(raw) = strtab.get_at(sym.st_name).filter(|n| !n.is_empty()) else {
                continue;
            };
            symbols.push(Symbol {
                address: bias.wrapping_add(sym.st_value as usize),
                size: sym.st_size as usize,
                name: demangle(raw),
                module,
            });
        }
    }

    fn load_object(
        object: &LoadedObject,
        module: usize,
        symbols: &mut Vec<Symbol>,
    ) -> anyhow::Result<()> {
        let bytes = std::fs::read(&object.path)
            .with_context(|| format!("reading {}", object.path.display()))?;
        let elf = Elf::parse(&bytes).with_context(|| format!("parsing {}", object.path.display()))?;
        push_functions(symbols, &elf.syms, &elf.strtab, object.bias, module);
        push_functions(symbols, &elf.dynsyms, &elf.dynstrtab, object.bias, module);
        Ok(())
    }

    impl SymbolTable {
        /// Reads the symbol tables of the executable and every shared object currently loaded.
        /// Objects that can't be read (e.g. the vdso) are skipped.
        /// Libraries loaded after this call won't be symbolicated.
        pub fn load_current_process() -> anyhow::Result<Self> {
            let objects = loaded_objects();
            anyhow::ensure!(!objects.is_empty(), "dl_iterate_phdr reported no objects");
            let mut modules = Vec::with_capacity(objects.len());
            let mut symbols = Vec::new();
            for object in &objects {
                if let Err(e) = load_object(object, modules.len(), &mut symbols) {
                    tracing::debug!("Skipping symbols of {}: {e:#}", object.path.display());
                }
                let name = match object.path.to_str() {
                    Some("/proc/self/exe") => std::env::current_exe()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|_| "/proc/self/exe".to_owned()),
                    _ => object.path.display().to_string(),
                };
                modules.push(name.into_boxed_str());
            }
            Ok(Self::new(modules, symbols))
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl SymbolTable {
    /// Symbol tables are only read from ELF objects; elsewhere frames stay address-only.
    pub fn load_current_process() -> anyhow::Result<Self> {
        Ok(Self::default())
    }
}

/// Pairs each raw frame with its symbol, if `mode` asks for it and the table knows it.
/// Writes at most `out.len()` frames and returns how many were written.
///
/// Frames past the first hold return addresses, which point at the instruction after the
/// call; they are looked up one byte earlier so a call at the very end of a function is
/// attributed correctly.
/// SIGNAL SAFETY:
///     No allocation; lookups are binary searches.
pub fn resolve<'a>(
    frames: &[RawFrame],
    mode: ResolveFrames,
    table: Option<&'a SymbolTable>,
    out: &mut [Frame<'a>],
) -> usize {
    let table = match mode {
        ResolveFrames::Fast => None,
        ResolveFrames::Full => table,
    };
    let mut n = 0;
    for (i, (raw, slot)) in frames.iter().zip(out.iter_mut()).enumerate() {
        let lookup_addr = if i == 0 {
            raw.ip
        } else {
            raw.ip.saturating_sub(1)
        };
        *slot = Frame {
            raw: *raw,
            symbol: table.and_then(|t| t.lookup(lookup_addr)),
        };
        n += 1;
    }
    n
}

/// Walks the current stack into `out`, starting at the frame whose ip is `fault_ip` so that the
/// crash handler's own frames are left out. If that frame is never seen (the unwinder may not
/// step through the signal trampoline on every platform), every frame is emitted instead.
///
/// Returns the number of frames written and whether the walk was cut short by `out` filling up.
///
/// # Safety
/// `backtrace::trace_unsynchronized` must not run concurrently with another unsynchronized
/// trace. The crash handler guarantees this with its reentrancy guard.
pub unsafe fn walk_stack(fault_ip: usize, out: &mut [RawFrame]) -> (usize, bool) {
    let mut ip_found = fault_ip == 0;
    let mut count = 0;
    let mut truncated = false;
    loop {
        let mut skipped = 0;
        // SAFETY: precondition of this function
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let ip = frame.ip() as usize;
                if ip == fault_ip {
                    ip_found = true;
                }
                if !ip_found {
                    // A corrupted stack could loop forever; give up after as many frames as we
                    // would have kept.
                    skipped += 1;
                    return skipped < out.len();
                }
                let Some(slot) = out.get_mut(count) else {
                    truncated = true;
                    return false;
                };
                *slot = RawFrame {
                    ip,
                    sp: frame.sp() as usize,
                    symbol_address: frame.symbol_address() as usize,
                };
                count += 1;
                true
            });
        }
        if ip_found {
            break;
        }
        // emit anything at all, if the crashing frame is not found for some reason
        ip_found = true;
    }
    (count, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_table() -> SymbolTable {
        SymbolTable::new(
            vec!["/bin/app".into(), "/lib/libc.so.6".into()],
            vec![
                Symbol {
                    address: 0x2000,
                    size: 0x100,
                    name: "second".into(),
                    module: 0,
                },
                Symbol {
                    address: 0x1000,
                    size: 0x80,
                    name: "first".into(),
                    module: 0,
                },
                Symbol {
                    address: 0x3000,
                    size: 0,
                    name: "unsized".into(),
                    module: 0,
                },
                Symbol {
                    address: 0x4000,
                    size: 0,
                    name: "last_in_app".into(),
                    module: 0,
                },
                Symbol {
                    address: 0x9000,
                    size: 0x10,
                    name: "kill".into(),
                    module: 1,
                },
                // Alias of `first` without a size; must not shadow it.
                Symbol {
                    address: 0x1000,
                    size: 0,
                    name: "first_alias".into(),
                    module: 0,
                },
            ],
        )
    }

    #[test]
    fn test_lookup_hits_and_misses() {
        let table = test_table();
        assert_eq!(table.len(), 5);

        let hit = table.lookup(0x1010).unwrap();
        assert_eq!(hit.name, "first");
        assert_eq!(hit.module, "/bin/app");
        assert_eq!(hit.address, 0x1000);

        assert_eq!(table.lookup(0x20ff).unwrap().name, "second");
        assert_eq!(table.lookup(0x9008).unwrap().module, "/lib/libc.so.6");

        // Past the end of a sized symbol
        assert_eq!(table.lookup(0x1080), None);
        assert_eq!(table.lookup(0x2100), None);
        // Below everything
        assert_eq!(table.lookup(0x10), None);
        // Unsized symbol extends to the next one in the same module...
        assert_eq!(table.lookup(0x3500).unwrap().name, "unsized");
        // ...but not across modules
        assert_eq!(table.lookup(0x4500), None);
        // Past the last symbol
        assert_eq!(table.lookup(usize::MAX), None);
    }

    #[test]
    fn test_resolve_modes() {
        let table = test_table();
        let raw = [
            RawFrame {
                ip: 0x1000,
                sp: 0x7000,
                symbol_address: 0x1000,
            },
            // Return address one past the end of `second`: belongs to the call in `second`.
            RawFrame {
                ip: 0x2100,
                sp: 0x7010,
                symbol_address: 0x2000,
            },
            RawFrame {
                ip: 0x8000,
                sp: 0x7020,
                symbol_address: 0,
            },
        ];
        let mut out = [Frame::EMPTY; 8];

        let n = resolve(&raw, ResolveFrames::Fast, Some(&table), &mut out);
        assert_eq!(n, 3);
        assert!(out[..n].iter().all(|f| f.symbol.is_none()));
        assert_eq!(out[1].raw, raw[1]);

        let n = resolve(&raw, ResolveFrames::Full, Some(&table), &mut out);
        assert_eq!(n, 3);
        assert_eq!(out[0].symbol.unwrap().name, "first");
        assert_eq!(out[1].symbol.unwrap().name, "second");
        assert_eq!(out[2].symbol, None);

        // Full without a table degrades to addresses
        let n = resolve(&raw, ResolveFrames::Full, None, &mut out);
        assert!(out[..n].iter().all(|f| f.symbol.is_none()));

        // Output capacity caps the result
        let mut small = [Frame::EMPTY; 2];
        assert_eq!(resolve(&raw, ResolveFrames::Full, Some(&table), &mut small), 2);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_walk_stack_is_bounded() {
        let mut out = [RawFrame::EMPTY; 2];
        let (n, truncated) = unsafe { walk_stack(0, &mut out) };
        assert_eq!(n, 2);
        assert!(truncated);

        let mut out = [RawFrame::EMPTY; 256];
        let (n, truncated) = unsafe { walk_stack(0, &mut out) };
        assert!(n > 2);
        assert!(!truncated);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_walk_stack_unknown_ip_emits_everything() {
        let mut out = [RawFrame::EMPTY; 256];
        let (all, _) = unsafe { walk_stack(0, &mut out) };
        let (n, _) = unsafe { walk_stack(1, &mut out) };
        // Both calls are made from this function, so the fallback walk has the same depth.
        assert_eq!(n, all);
    }

    #[inline(never)]
    fn marker_function_for_symbol_lookup() -> usize {
        marker_function_for_symbol_lookup as usize
    }

    #[test]
    #[cfg(target_os = "linux")]
    #[cfg_attr(miri, ignore)]
    fn test_load_current_process() {
        let table = SymbolTable::load_current_process().unwrap();
        assert!(!table.is_empty());
        assert!(!table.modules().is_empty());

        let addr = marker_function_for_symbol_lookup();
        let symbol = table.lookup(addr).expect("test function should be in the symtab");
        assert!(
            symbol.name.contains("marker_function_for_symbol_lookup"),
            "got {symbol:?}"
        );
        // Names are demangled at load time
        assert!(!symbol.name.starts_with("_ZN"), "got {symbol:?}");
    }
}
