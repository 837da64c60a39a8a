//! x86 interrupt/exception glue (`SPEC_FULL.md` §6, the "gate" step of
//! §2's data-flow line).
//!
//! `kernel.rs` installs a single IDT handler per vector that pushes a
//! `TrapFrame` and calls [`classify`] to decide what this trap is, the same
//! three-way split the teacher's own `usertrap` makes between syscall,
//! interrupt, and bad trap — just over x86 vector numbers instead of RISC-V
//! `scause`. The register-frame layout, vector numbers, and `SyscallArgs`
//! reads are pure data and are unit-tested here; the IDT itself, and the
//! bundle of kernel tables a trap needs to actually act on, are `kernel.rs`'s
//! job, since this module must stay buildable without a boot-time kernel
//! context (the same ahead-of-its-layer seam `wait::Blocking` and
//! `exec::ExecSource` use).

use crate::exec::ExecImage;
use crate::syscall::SyscallArgs;

/// Exception vectors this kernel cares about; everything else (0-31 minus
/// these) is routed to [`TrapKind::Fault`].
pub const T_PAGE_FAULT: u32 = 14;

/// IRQ vectors are remapped above the CPU exception range, past the
/// syscall gate, the same offset the teacher's platform uses for its own
/// external-interrupt range.
pub const T_IRQ0: u32 = 32;
pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KEYBOARD: u32 = 1;
pub const IRQ_IDE: u32 = 14;

/// Software-interrupt vector user space traps through for a syscall.
pub const T_SYSCALL: u32 = 64;

/// What a raw vector number means to the core, independent of which device
/// or syscall it names.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TrapKind {
    Syscall,
    PageFault,
    Irq(u32),
    Fault,
}

/// Classifies a raw IDT vector. Pure lookup, no kernel state touched.
pub fn classify(vector: u32) -> TrapKind {
    if vector == T_SYSCALL {
        TrapKind::Syscall
    } else if vector == T_PAGE_FAULT {
        TrapKind::PageFault
    } else if vector >= T_IRQ0 {
        TrapKind::Irq(vector - T_IRQ0)
    } else {
        TrapKind::Fault
    }
}

/// The register/interrupt frame the trap gate leaves on the kernel stack:
/// `pusha` (edi..eax), the four segment selectors the gate pushes by hand,
/// `trapno`/`err`, then whatever the CPU itself pushed (`eip`/`cs`/`eflags`,
/// plus `esp`/`ss` only when the trap crossed from user to kernel mode,
/// which is the only case this kernel's gate ever builds one for).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// `esp` at the time of `pusha`; stale the instant `pusha` ran and
    /// never used for anything, kept only because `pusha`/`popa` are
    /// symmetric and the gate doesn't special-case this one slot.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// Syscall arguments are passed in registers (`ebx, ecx, edx, esi, edi`),
/// `eax` carrying the syscall number itself — simpler than the teacher's
/// own convention of reading them back off the user stack, and sufficient
/// since this kernel never needs more than `syscall::SyscallArgs`'s handful
/// of word-sized arguments.
impl SyscallArgs for TrapFrame {
    fn arg_int(&self, n: usize) -> i32 {
        match n {
            0 => self.ebx as i32,
            1 => self.ecx as i32,
            2 => self.edx as i32,
            3 => self.esi as i32,
            4 => self.edi as i32,
            _ => 0,
        }
    }

    fn arg_addr(&self, n: usize) -> usize {
        self.arg_int(n) as u32 as usize
    }
}

impl TrapFrame {
    /// The syscall number `eax` carried in on the way down, before
    /// dispatch overwrites it with the return value.
    pub fn syscall_num(&self) -> i32 {
        self.eax as i32
    }

    /// Places a syscall's return value where user space's `eax` will read
    /// it after `iret`.
    pub fn set_return(&mut self, value: i32) {
        self.eax = value as u32;
    }

    /// Was this trap taken from user mode? x86 pushes a nonzero privilege
    /// level in the low two bits of `cs`, only when a ring change occurred.
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 != 0
    }

    /// Rewrites this frame so `iret` resumes at a freshly exec'd image's
    /// entry point instead of wherever the `execve` call itself trapped
    /// from, per `exec::exec`'s "the old image is gone" contract. `eax` is
    /// set to `0`, matching every other successful syscall's return
    /// convention, since the calling process does see `execve` "return"
    /// exactly once (into the new image, at its entry point).
    pub fn forge_execve_entry(&mut self, image: &ExecImage) {
        self.eip = image.entry as u32;
        self.esp = image.user_sp as u32;
        self.eax = 0;
    }
}

/// `cr2` holds the faulting linear address; `kernel.rs`'s page-fault
/// handler reads it (an x86 primitive, not data `TrapFrame` carries) and
/// passes it alongside this frame's `err` to `vm::AddressSpace::handle_fault`.
#[cfg(target_arch = "x86")]
#[inline]
pub unsafe fn r_cr2() -> u32 {
    let x: u32;
    unsafe { core::arch::asm!("mov {0}, cr2", out(reg) x, options(nomem, nostack, preserves_flags)) };
    x
}
#[cfg(not(target_arch = "x86"))]
pub unsafe fn r_cr2() -> u32 {
    unreachable!("x86 primitive called on a non-x86 host build")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_args(a: u32, b: u32, c: u32, d: u32, e: u32) -> TrapFrame {
        TrapFrame { ebx: a, ecx: b, edx: c, esi: d, edi: e, ..Default::default() }
    }

    #[test]
    fn classify_recognizes_syscall_page_fault_and_irq() {
        assert_eq!(classify(T_SYSCALL), TrapKind::Syscall);
        assert_eq!(classify(T_PAGE_FAULT), TrapKind::PageFault);
        assert_eq!(classify(T_IRQ0 + IRQ_TIMER), TrapKind::Irq(IRQ_TIMER));
        assert_eq!(classify(T_IRQ0 + IRQ_IDE), TrapKind::Irq(IRQ_IDE));
        assert_eq!(classify(13), TrapKind::Fault);
    }

    #[test]
    fn arg_int_reads_the_conventional_register_order() {
        let tf = frame_with_args(10, 20, 30, 40, 50);
        assert_eq!(tf.arg_int(0), 10);
        assert_eq!(tf.arg_int(1), 20);
        assert_eq!(tf.arg_int(2), 30);
        assert_eq!(tf.arg_int(3), 40);
        assert_eq!(tf.arg_int(4), 50);
        assert_eq!(tf.arg_int(5), 0);
    }

    #[test]
    fn arg_addr_reinterprets_the_same_register_as_unsigned() {
        let tf = frame_with_args(u32::MAX, 0, 0, 0, 0);
        assert_eq!(tf.arg_addr(0), u32::MAX as usize);
    }

    #[test]
    fn set_return_and_syscall_num_round_trip_through_eax() {
        let mut tf = TrapFrame { eax: 7, ..Default::default() };
        assert_eq!(tf.syscall_num(), 7);
        tf.set_return(-1);
        assert_eq!(tf.eax, u32::MAX);
    }

    #[test]
    fn from_user_checks_the_saved_cs_privilege_bits() {
        let kernel_trap = TrapFrame { cs: 0x08, ..Default::default() };
        let user_trap = TrapFrame { cs: 0x1b, ..Default::default() };
        assert!(!kernel_trap.from_user());
        assert!(user_trap.from_user());
    }

    #[test]
    fn forge_execve_entry_sets_eip_esp_and_a_zero_return() {
        let mut tf = TrapFrame { eip: 0x1000, esp: 0x2000, eax: 99, ..Default::default() };
        let image = ExecImage { entry: 0x4000_1000, user_sp: 0x0FBF_FFF0, image_text: 0, image_data: 0, image_end: 0 };
        tf.forge_execve_entry(&image);
        assert_eq!(tf.eip, 0x4000_1000);
        assert_eq!(tf.esp, 0x0FBF_FFF0);
        assert_eq!(tf.eax, 0);
    }
}
