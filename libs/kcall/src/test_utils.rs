// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use kmem::arch::PagingMode;
use kmem::arch::i386::I386;
use kmem::test_utils::{
    AddressSpace, EmulateArch, FRAME_SIZE, FRAMES_START, Frames, MEMORY_END, Machine,
};
use kmem::{PhysicalAddress, ProcNr, VirtualAddress};
use kwin_util::CpuId;

use crate::{BootInfo, CallMask, Endpoint, Kernel};

pub const CPUS: usize = 2;
/// Where test processes keep their memory.
pub const USER_BASE: VirtualAddress = VirtualAddress::new(0x0800_0000);

/// A two CPU kernel on an emulated i386 machine.
///
/// Each CPU runs its own page table owner (slots 1 and 2) that maps all of physical memory
/// one-to-one. Slot 1 doubles as the VM server.
pub struct TestKernel {
    pub machine: Machine<I386>,
    pub frames: Arc<Frames>,
    pub kernel: Kernel<EmulateArch<I386>>,
    pub ptprocs: Vec<Endpoint>,
}

impl TestKernel {
    pub fn new() -> Self {
        Self::with_args("")
    }

    pub fn with_args(args: &str) -> Self {
        let machine = Machine::<I386>::new([PhysicalAddress::ZERO..MEMORY_END]);
        let frames = Frames::new(FRAMES_START..MEMORY_END);

        let mut kinfo = BootInfo {
            freepde_start: I386::DIR_ENTRIES - 4,
        };
        let kernel = Kernel::new(
            &args.parse().unwrap(),
            &mut kinfo,
            (0..CPUS).map(|cpu| machine.arch(CpuId::new(cpu))),
        );
        assert_eq!(kinfo.freepde_start, I386::DIR_ENTRIES - 2);

        let mut ptprocs = Vec::new();
        for cpu in 0..CPUS {
            let nr = i32::try_from(cpu).unwrap() + 1;
            let endpoint = kernel.procs().spawn(ProcNr(nr), CallMask::all()).unwrap();
            let aspace = AddressSpace::new(&machine, &frames);
            aspace.map_identity(PhysicalAddress::ZERO..MEMORY_END);

            let k = kernel.enter(CpuId::new(cpu));
            k.set_address_space(endpoint, aspace.root(), aspace.root().identity())
                .unwrap();
            k.switch_address_space(endpoint).unwrap();
            ptprocs.push(endpoint);
        }

        Self {
            machine,
            frames,
            kernel,
            ptprocs,
        }
    }

    /// The VM server.
    pub fn vm(&self) -> Endpoint {
        self.ptprocs[0]
    }

    /// Starts a process in slot `nr` with an empty address space that may make every call.
    pub fn spawn(&self, nr: i32) -> (Endpoint, AddressSpace<I386>) {
        self.spawn_with(nr, CallMask::all())
    }

    pub fn spawn_with(&self, nr: i32, calls: CallMask) -> (Endpoint, AddressSpace<I386>) {
        let endpoint = self.kernel.procs().spawn(ProcNr(nr), calls).unwrap();
        let aspace = AddressSpace::new(&self.machine, &self.frames);
        self.kernel
            .enter(CpuId::BOOT)
            .set_address_space(endpoint, aspace.root(), aspace.root().identity())
            .unwrap();
        (endpoint, aspace)
    }

    /// Maps fresh memory holding `data` at the page aligned `virt` of `aspace`, returning
    /// where it lives physically.
    pub fn populate(
        &self,
        aspace: &AddressSpace<I386>,
        virt: VirtualAddress,
        data: &[u8],
    ) -> PhysicalAddress {
        let len = u32::try_from(data.len())
            .unwrap()
            .next_multiple_of(FRAME_SIZE);
        let phys = self.frames.alloc(len);
        aspace.map(virt, phys, len, true);
        self.machine.write_phys(phys, data);
        phys
    }
}
