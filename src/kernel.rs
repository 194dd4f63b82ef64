//! The kernel: every lifecycle-bounded singleton, const-constructed into
//! one `static`, plus the boot sequence.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::bio::{new_bcache, Bcache};
use crate::console::Console;
use crate::disk::Disk;
use crate::file::{new_ftable, Devsw, FileTable};
use crate::fs::{new_itable, DevTab, FileSystem, Itable};
use crate::kalloc::Kmem;
use crate::lock::{Sleepablelock, Spinlock};
use crate::param::NDEV;
use crate::proc::Procs;

/// The kernel. Constructed at compile time; subsystems that need runtime
/// setup (memory ranges, the mounted volume, CPU records) are initialized
/// from `main` before the first process runs, and torn down never.
pub struct Kernel {
    panicked: AtomicBool,

    /// Physical page allocator.
    pub kmem: Kmem,

    /// Timer tick count, incremented by CPU 0. Sleepers on `ticks` wait
    /// for its channel.
    pub ticks: Sleepablelock<u32>,

    /// Process system.
    pub procs: Procs,

    /// Buffer cache.
    bcache: Bcache,

    /// Block I/O gateway.
    disk: Disk,

    /// Console line discipline.
    pub console: Sleepablelock<Console>,

    /// Map from major device number to device read/write routines.
    pub devsw: Spinlock<[Devsw; NDEV]>,

    /// Open-file table.
    ftable: FileTable,

    /// In-memory inode cache.
    itable: Itable,

    /// The mounted ext2 volume.
    pub fs: FileSystem,

    /// Device-inode registry, loaded from /etc/devtab at mount.
    pub devtab: DevTab,
}

static KERNEL: Kernel = Kernel::new();

/// The kernel.
#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

impl Kernel {
    const fn new() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            kmem: Kmem::new(),
            ticks: Sleepablelock::new("time", 0),
            procs: Procs::new(),
            bcache: new_bcache(),
            disk: Disk::new(),
            console: Sleepablelock::new("cons", Console::new()),
            devsw: Spinlock::new("devsw", [Devsw::none(); NDEV]),
            ftable: new_ftable(),
            itable: new_itable(),
            fs: FileSystem::new(),
            devtab: DevTab::new(),
        }
    }

    pub fn bcache(&'static self) -> &'static Bcache {
        &self.bcache
    }

    pub fn disk(&'static self) -> &'static Disk {
        &self.disk
    }

    pub fn ftable(&'static self) -> &'static FileTable {
        &self.ftable
    }

    pub fn itable(&'static self) -> &'static Itable {
        &self.itable
    }

    pub fn set_panicked(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }
}

#[cfg(all(target_arch = "x86", not(test)))]
mod boot {
    use core::sync::atomic::Ordering;

    use super::kernel;
    use crate::arch;
    use crate::cpu::{cpu_id, CPUS};
    use crate::param::{KSTACKSIZE, NCPU};
    use crate::println;
    use crate::vm;

    extern "C" {
        /// First address after the kernel image, from the linker script.
        static end: [u8; 0];
    }

    /// Bootstrap processor entry, reached from the multiboot entry stub
    /// with paging on and a boot stack.
    #[no_mangle]
    pub unsafe extern "C" fn kernel_entry() -> ! {
        let kernel = kernel();

        // Physical pages between the kernel image and the 8 MiB the boot
        // page directory maps.
        let first = unsafe { end.as_ptr() as usize };
        unsafe { kernel.kmem.init_phase1(first, arch::p2v(8 * 1024 * 1024)) };

        // Kernel page table.
        vm::kvm_init();

        // Detect other processors, set up interrupt controllers.
        let mut apicids = [0u32; NCPU];
        let ncpu = arch::mp_init(&mut apicids);
        unsafe { CPUS.init(&apicids[..ncpu]) };
        arch::lapic_init();
        unsafe { arch::seg_init(cpu_id()) };
        arch::pic_init();
        arch::ioapic_init();

        // Console hardware, then the rest of the machine.
        arch::uart_init();
        crate::console::init();
        unsafe { arch::tv_init() };
        kernel.disk().init();
        crate::trap::enable_irqs();

        unsafe { start_others() };
        unsafe {
            kernel
                .kmem
                .init_phase2(arch::p2v(8 * 1024 * 1024), arch::p2v(arch::PHYSTOP))
        };

        // First user process.
        kernel.procs.user_init();

        mp_main();
    }

    /// Application processor entry, reached from the AP bootstrap blob.
    #[no_mangle]
    pub unsafe extern "C" fn mp_enter() -> ! {
        vm::kvm_switch();
        unsafe { arch::seg_init(cpu_id()) };
        arch::lapic_init();
        mp_main();
    }

    /// Common per-CPU setup; ends in the scheduler.
    fn mp_main() -> ! {
        println!("cpu{}: starting", cpu_id());
        unsafe { arch::idt_init() };
        let cpu = CPUS.current_raw();
        // SAFETY: each CPU touches only its own record here.
        unsafe { (*cpu).started.store(true, Ordering::Release) };
        kernel().procs.scheduler()
    }

    /// Start the application processors: copy the bootstrap blob to low
    /// memory, hand each AP a stack, an entry point and the boot page
    /// directory, and kick it with a startup IPI.
    unsafe fn start_others() {
        let (blob, blob_len) = arch::entryother();
        let code = arch::p2v(0x7000) as *mut u8;
        unsafe { core::ptr::copy_nonoverlapping(blob, code, blob_len) };

        println!("{} cpus", CPUS.count());

        for i in 0..CPUS.count() {
            if i == cpu_id() {
                continue;
            }
            let cpu = CPUS.get(i);

            // Arguments for the blob, stored just under its entry point:
            // stack top, Rust entry, boot page directory.
            let stack = kernel().kmem.alloc().expect("start_others").into_usize();
            unsafe {
                let args = code as *mut u32;
                *args.sub(1) = (stack + KSTACKSIZE) as u32;
                *args.sub(2) = mp_enter as usize as u32;
                *args.sub(3) = arch::v2p(&crate::arch::entrypgdir as *const _ as usize) as u32;

                arch::lapic_start_ap((*cpu).apicid, arch::v2p(code as usize) as u32);
            }

            // Wait for the AP to finish mp_main setup.
            while unsafe { !(*cpu).started.load(Ordering::Acquire) } {
                core::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
pub mod test_util {
    use std::sync::{Mutex, MutexGuard};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Tests touching the shared kernel singletons (buffer cache, disk
    /// image, inode cache) run one at a time.
    static LOCK: Mutex<()> = Mutex::new(());

    pub fn serial() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A device number nobody else used, so cached identities from other
    /// tests can never alias.
    pub fn fresh_dev() -> u32 {
        static NEXT: AtomicU32 = AtomicU32::new(10);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    /// Seed the kernel's page allocator with leaked host memory, once.
    pub fn ensure_kmem() {
        use crate::arch::mmu::{pg_round_up, PGSIZE};
        use std::sync::Once;
        use std::vec;

        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let buf = vec![0u8; 513 * PGSIZE].leak();
            let start = pg_round_up(buf.as_ptr() as usize);
            unsafe { super::kernel().kmem.init_phase1(start, start + 512 * PGSIZE) };
        });
    }
}
