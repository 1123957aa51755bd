// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;

use kwin_util::CpuId;
use parking_lot::Mutex;

use crate::arch::{DirectoryEntry, PagingMode, TableEntry};
use crate::test_utils::arch::EmulateArch;
use crate::test_utils::memory::Memory;
use crate::{PhysicalAddress, VirtualAddress};

/// A "virtual machine" with 32-bit two-level paging. It is intended to be used in tests and
/// models the following properties:
///
/// - multiple, discontiguous physical memory regions
/// - one loaded page directory per CPU
/// - per-CPU translation caches that only pick up page table changes when reloaded
/// - write protection
/// - copy primitives that report faults rounded down to [`PagingMode::COPY_GRANULE`]
pub struct Machine<M>(Arc<MachineInner<M>>);

struct MachineInner<M> {
    // lock order: `cpus` before `memory`
    cpus: Mutex<BTreeMap<usize, Cpu>>,
    memory: Mutex<Memory>,
    injected_fault: Mutex<Option<VirtualAddress>>,
    _mode: PhantomData<fn() -> M>,
}

impl<M> Clone for Machine<M> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<M: PagingMode> fmt::Debug for Machine<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("mode", &M::NAME)
            .field("memory", &*self.0.memory.lock())
            .field("cpus", &*self.0.cpus.lock())
            .finish_non_exhaustive()
    }
}

impl<M: PagingMode> Machine<M> {
    pub fn new(regions: impl IntoIterator<Item = Range<PhysicalAddress>>) -> Self {
        Self(Arc::new(MachineInner {
            cpus: Mutex::new(BTreeMap::new()),
            memory: Mutex::new(Memory::new(regions)),
            injected_fault: Mutex::new(None),
            _mode: PhantomData,
        }))
    }

    /// The hardware interface of `cpu`.
    pub fn arch(&self, cpu: CpuId) -> EmulateArch<M> {
        EmulateArch::new(self.clone(), cpu)
    }

    /// # Panics
    ///
    /// Panics if the range is outside of memory.
    pub fn read_phys(&self, address: PhysicalAddress, len: u32) -> Vec<u8> {
        let mut buf = vec![0; len as usize];
        self.0.memory.lock().read(address, &mut buf);
        buf
    }

    /// # Panics
    ///
    /// Panics if the range is outside of memory.
    pub fn write_phys(&self, address: PhysicalAddress, bytes: &[u8]) {
        self.0.memory.lock().write(address, bytes);
    }

    /// # Panics
    ///
    /// Panics if the word is outside of memory.
    pub fn read_phys_u32(&self, address: PhysicalAddress) -> u32 {
        self.0.memory.lock().read_u32(address)
    }

    /// # Panics
    ///
    /// Panics if the word is outside of memory.
    pub fn write_phys_u32(&self, address: PhysicalAddress, value: u32) {
        self.0.memory.lock().write_u32(address, value);
    }

    pub fn active_root(&self, cpu: CpuId) -> Option<PhysicalAddress> {
        self.0.cpus.lock().get(&cpu.get()).and_then(|cpu| cpu.root)
    }

    pub fn set_active_root(&self, cpu: CpuId, root: PhysicalAddress) {
        let mut cpus = self.0.cpus.lock();
        let state = cpus.entry(cpu.get()).or_default();
        state.root = Some(root);
        state.reload::<M>(&self.0.memory.lock());
    }

    pub fn reload(&self, cpu: CpuId) {
        let mut cpus = self.0.cpus.lock();
        cpus.entry(cpu.get())
            .or_default()
            .reload::<M>(&self.0.memory.lock());
    }

    /// How often the translation cache of `cpu` was reloaded.
    pub fn reloads(&self, cpu: CpuId) -> usize {
        self.0.cpus.lock().get(&cpu.get()).map_or(0, |cpu| cpu.reloads)
    }

    /// Makes the next copy, read or fill on any CPU fail at `addr` without touching memory.
    pub fn inject_copy_fault(&self, addr: VirtualAddress) {
        *self.0.injected_fault.lock() = Some(addr);
    }

    pub(crate) fn copy(
        &self,
        cpu: CpuId,
        src: VirtualAddress,
        dst: VirtualAddress,
        len: u32,
    ) -> Result<(), VirtualAddress> {
        self.take_injected_fault()?;
        let cpus = self.0.cpus.lock();
        let state = cpus.get(&cpu.get());
        let mut memory = self.0.memory.lock();

        let mut done = 0;
        while done < len {
            let (from, from_len) = resolve::<M>(state, &memory, src.wrapping_add(done), false)?;
            let (to, to_len) = resolve::<M>(state, &memory, dst.wrapping_add(done), true)?;
            let n = (len - done).min(from_len).min(to_len);
            memory.copy(from, to, n);
            done += n;
        }

        Ok(())
    }

    pub(crate) fn read(
        &self,
        cpu: CpuId,
        src: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), VirtualAddress> {
        self.take_injected_fault()?;
        let cpus = self.0.cpus.lock();
        let state = cpus.get(&cpu.get());
        let memory = self.0.memory.lock();

        let mut done = 0;
        while done < buf.len() {
            let addr = src.wrapping_add(u32::try_from(done).unwrap_or(u32::MAX));
            let (from, from_len) = resolve::<M>(state, &memory, addr, false)?;
            let n = (buf.len() - done).min(from_len as usize);
            memory.read(from, &mut buf[done..done + n]);
            done += n;
        }

        Ok(())
    }

    pub(crate) fn fill(
        &self,
        cpu: CpuId,
        dst: VirtualAddress,
        pattern: u32,
        len: u32,
    ) -> Result<(), VirtualAddress> {
        self.take_injected_fault()?;
        let cpus = self.0.cpus.lock();
        let state = cpus.get(&cpu.get());
        let mut memory = self.0.memory.lock();
        let pattern = pattern.to_ne_bytes();

        let mut done = 0;
        while done < len {
            let (to, to_len) = resolve::<M>(state, &memory, dst.wrapping_add(done), true)?;
            let n = (len - done).min(to_len);
            let bytes: Vec<u8> = (done..done + n)
                .map(|i| pattern[i as usize % pattern.len()])
                .collect();
            memory.write(to, &bytes);
            done += n;
        }

        Ok(())
    }

    fn take_injected_fault(&self) -> Result<(), VirtualAddress> {
        match self.0.injected_fault.lock().take() {
            Some(addr) => Err(addr),
            None => Ok(()),
        }
    }
}

/// Translates `addr` through the cached translations of a CPU, returning the physical address
/// and how many bytes from there on are mapped and backed by memory.
fn resolve<M: PagingMode>(
    cpu: Option<&Cpu>,
    memory: &Memory,
    addr: VirtualAddress,
    write: bool,
) -> Result<(PhysicalAddress, u32), VirtualAddress> {
    let fault = addr.align_down(M::COPY_GRANULE);

    let Some(mapping) = cpu.and_then(|cpu| cpu.lookup(addr)) else {
        log::trace!("emulated fault at {addr}: not mapped");
        return Err(fault);
    };
    if write && !mapping.writable {
        log::trace!("emulated fault at {addr}: write to read-only page");
        return Err(fault);
    }
    let Some(in_memory) = memory.available(mapping.phys) else {
        log::trace!("emulated fault at {addr}: {} is not memory", mapping.phys);
        return Err(fault);
    };

    Ok((mapping.phys, mapping.len.min(in_memory)))
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    phys: PhysicalAddress,
    len: u32,
    writable: bool,
}

#[derive(Debug, Default)]
struct Cpu {
    root: Option<PhysicalAddress>,
    /// Cached translations keyed by the first linear address they cover.
    tlb: BTreeMap<VirtualAddress, Mapping>,
    reloads: usize,
}

impl Cpu {
    /// The cached translation of `addr`, with `len` counted from `addr` on.
    fn lookup(&self, addr: VirtualAddress) -> Option<Mapping> {
        let (start, mapping) = self.tlb.range(..=addr).next_back()?;
        let offset = addr.offset_from_unsigned(*start);
        (offset < mapping.len).then(|| Mapping {
            phys: mapping.phys.add(offset),
            len: mapping.len - offset,
            writable: mapping.writable,
        })
    }

    /// Rebuilds the cached translations from the loaded page directory.
    fn reload<M: PagingMode>(&mut self, memory: &Memory) {
        self.reloads += 1;
        self.tlb.clear();

        let Some(root) = self.root else {
            return;
        };

        for dir_index in 0..M::DIR_ENTRIES {
            let pde = M::DirEntry::from_raw(memory.read_u32(root.add(M::dir_entry_offset(dir_index))));
            if !pde.is_present() {
                continue;
            }

            let base = M::window_base(dir_index);
            if pde.is_big_page() {
                self.tlb.insert(
                    base,
                    Mapping {
                        phys: pde.address(),
                        len: M::WINDOW_SIZE,
                        writable: pde.is_writable(),
                    },
                );
                continue;
            }

            for table_index in 0..M::TABLE_ENTRIES {
                let pte = M::TableEntry::from_raw(
                    memory.read_u32(pde.address().add(M::table_entry_offset(table_index))),
                );
                if pte.is_present() {
                    let offset = u32::try_from(table_index).unwrap_or(u32::MAX) * M::PAGE_SIZE;
                    self.tlb.insert(
                        base.add(offset),
                        Mapping {
                            phys: pte.address(),
                            len: M::PAGE_SIZE,
                            writable: pde.is_writable() && pte.is_writable(),
                        },
                    );
                }
            }
        }
    }
}
