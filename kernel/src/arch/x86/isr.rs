//! Interrupt service routines and dispatch.
//!
//! Assembled stubs push a canonical [`Registers`] frame and hand its
//! address to [`isr_dispatch`]; whatever stack pointer the dispatcher
//! returns is loaded before the frame is popped, which is how the
//! scheduler switches tasks: return a pointer into another kernel stack
//! and the iret resumes that task instead.

use spin::Mutex;

// --- Vector assignment ------------------------------------------------------

/// First vector of the hardware-IRQ range.
pub const IRQ0: u8 = 32;
pub const IRQ_PIT: u8 = 32;
pub const IRQ_KEYBOARD: u8 = 33;
pub const IRQ_COM2: u8 = 35;
pub const IRQ_COM1: u8 = 36;
pub const IRQ_PS2_AUX: u8 = 44;
/// Last vector of the hardware-IRQ range.
pub const IRQ15: u8 = 47;

/// Fires spuriously on the local APIC; acknowledged by doing nothing.
pub const IRQ_SPURIOUS: u8 = 63;
/// Local APIC timer, the scheduler tick.
pub const IRQ_TIMER: u8 = 64;
/// Local APIC error interrupt.
pub const IRQ_ERROR: u8 = 65;

pub const VECTOR_PAGE_FAULT: u8 = 14;
pub const VECTOR_SYSCALL: u8 = 128;

// --- The saved frame --------------------------------------------------------

/// Register frame as the stubs lay it out, lowest address first: the
/// segment registers we push, the `pushad` block, the vector and error
/// code, then what the CPU pushed on entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Registers {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,

    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// ESP as `pushad` saw it; ignored by `popad`.
    pub tampered_esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    /// Pushed by the stub.
    pub int_no: u32,
    /// Pushed by the CPU for some exceptions, 0 otherwise.
    pub err_code: u32,

    /// Pushed by the CPU on entry.
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

/// Size of the frame in bytes; process setup carves stacks with it.
pub const REGISTERS_FRAME_SIZE: u32 = core::mem::size_of::<Registers>() as u32;

/// A registered handler. The returned value becomes the stack pointer the
/// stub resumes with; handlers that do not switch return `regs` unchanged.
pub type IsrHandler = fn(&mut Registers) -> u32;

static HANDLERS: Mutex<[Option<IsrHandler>; 256]> = Mutex::new([None; 256]);

/// Classify vectors that must acknowledge the local APIC.
pub fn needs_lapic_eoi(vector: u8) -> bool {
    (IRQ0..=IRQ15).contains(&vector) || vector == IRQ_TIMER || vector == IRQ_ERROR
}

/// Classify vectors that (also) acknowledge the legacy 8259 path.
pub fn needs_pic_eoi(vector: u8) -> bool {
    (IRQ0..=IRQ15).contains(&vector)
}

fn spurious_handler(regs: &mut Registers) -> u32 {
    regs as *mut Registers as u32
}

/// Reset the dispatch table: everything unhandled except the spurious
/// vector, which is expected noise.
pub fn install() {
    let mut handlers = HANDLERS.lock();
    *handlers = [None; 256];
    handlers[IRQ_SPURIOUS as usize] = Some(spurious_handler);
}

/// Route `vector` to `handler`.
pub fn register_interrupt_handler(vector: u8, handler: IsrHandler) {
    HANDLERS.lock()[vector as usize] = Some(handler);
}

fn lookup(vector: u8) -> Option<IsrHandler> {
    HANDLERS.lock()[vector as usize]
}

/// Dump a saved frame, for faults and unhandled vectors.
pub fn print_registers(regs: &Registers) {
    log::error!(
        "eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
        regs.eax,
        regs.ebx,
        regs.ecx,
        regs.edx
    );
    log::error!(
        "edi={:#010x} esi={:#010x} ebp={:#010x} esp={:#010x}",
        regs.edi,
        regs.esi,
        regs.ebp,
        regs.tampered_esp
    );
    log::error!(
        "ds={:#06x} es={:#06x} fs={:#06x} gs={:#06x}",
        regs.ds,
        regs.es,
        regs.fs,
        regs.gs
    );
    log::error!(
        "eip={:#010x} cs={:#06x} eflags={:#010x} int={} err={:#x}",
        regs.eip,
        regs.cs,
        regs.eflags,
        regs.int_no,
        regs.err_code
    );
}

/// C-level dispatcher, called by the common stub with the frame address.
/// Returns the stack pointer to resume with.
#[cfg(target_arch = "x86")]
#[no_mangle]
pub extern "C" fn isr_dispatch(regs_ptr: *mut Registers) -> u32 {
    // SAFETY: the stub passes the frame it just pushed on this stack.
    let regs = unsafe { &mut *regs_ptr };
    let vector = (regs.int_no & 0xFF) as u8;

    // Acknowledge before the handler runs: a handler that switches tasks
    // never comes back here.
    if needs_pic_eoi(vector) {
        // SAFETY: 8259 EOI command ports.
        unsafe {
            if vector >= 40 {
                x86::io::outb(0xA0, 0x20);
            }
            x86::io::outb(0x20, 0x20);
        }
    }
    if needs_lapic_eoi(vector) {
        super::lapic::eoi();
    }

    match lookup(vector) {
        Some(handler) => handler(regs),
        None => {
            print_registers(regs);
            panic!("unhandled interrupt vector {vector}");
        }
    }
}

/// Gate target for vectors with no assembled stub at all. Entered straight
/// from the IDT; never returns.
#[cfg(target_arch = "x86")]
pub extern "C" fn idt_unhandled() {
    panic!("interrupt through an uninstalled gate");
}

#[cfg(target_arch = "x86")]
pub fn unhandled_vector_entry() -> u32 {
    idt_unhandled as usize as u32
}

// --- Assembled stubs --------------------------------------------------------

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
.macro INTR_NOERR name, num
.global \name
\name:
    push 0
    push \num
    jmp isr_common_stub
.endm

.macro INTR_ERR name, num
.global \name
\name:
    push \num
    jmp isr_common_stub
.endm

INTR_NOERR isr0, 0
INTR_NOERR isr1, 1
INTR_NOERR isr2, 2
INTR_NOERR isr3, 3
INTR_NOERR isr4, 4
INTR_NOERR isr5, 5
INTR_NOERR isr6, 6
INTR_NOERR isr7, 7
INTR_ERR   isr8, 8
INTR_NOERR isr9, 9
INTR_ERR   isr10, 10
INTR_ERR   isr11, 11
INTR_ERR   isr12, 12
INTR_ERR   isr13, 13
INTR_ERR   isr14, 14
INTR_NOERR isr15, 15
INTR_NOERR isr16, 16
INTR_ERR   isr17, 17
INTR_NOERR isr18, 18
INTR_NOERR isr19, 19
INTR_NOERR isr20, 20
INTR_NOERR isr21, 21
INTR_NOERR isr22, 22
INTR_NOERR isr23, 23
INTR_NOERR isr24, 24
INTR_NOERR isr25, 25
INTR_NOERR isr26, 26
INTR_NOERR isr27, 27
INTR_NOERR isr28, 28
INTR_NOERR isr29, 29
INTR_NOERR isr30, 30
INTR_NOERR isr31, 31

INTR_NOERR irq0, 32
INTR_NOERR irq1, 33
INTR_NOERR irq2, 34
INTR_NOERR irq3, 35
INTR_NOERR irq4, 36
INTR_NOERR irq5, 37
INTR_NOERR irq6, 38
INTR_NOERR irq7, 39
INTR_NOERR irq8, 40
INTR_NOERR irq9, 41
INTR_NOERR irq10, 42
INTR_NOERR irq11, 43
INTR_NOERR irq12, 44
INTR_NOERR irq13, 45
INTR_NOERR irq14, 46
INTR_NOERR irq15, 47

INTR_NOERR intr63, 63
INTR_NOERR intr64, 64
INTR_NOERR intr65, 65
INTR_NOERR isr128, 128

isr_common_stub:
    pushad
    push ds
    push es
    push fs
    push gs

    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax

    push esp
    call isr_dispatch
    add esp, 4

    mov esp, eax

    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 8
    iretd
"#
);

#[cfg(target_arch = "x86")]
macro_rules! stub_entries {
    ($(($vec:expr, $name:ident)),* $(,)?) => {{
        extern "C" {
            $(fn $name();)*
        }
        [$(($vec as u8, $name as usize as u32)),*]
    }};
}

/// (vector, stub address) for the 32 CPU exceptions.
#[cfg(target_arch = "x86")]
pub fn exception_stubs() -> [(u8, u32); 32] {
    stub_entries![
        (0, isr0),
        (1, isr1),
        (2, isr2),
        (3, isr3),
        (4, isr4),
        (5, isr5),
        (6, isr6),
        (7, isr7),
        (8, isr8),
        (9, isr9),
        (10, isr10),
        (11, isr11),
        (12, isr12),
        (13, isr13),
        (14, isr14),
        (15, isr15),
        (16, isr16),
        (17, isr17),
        (18, isr18),
        (19, isr19),
        (20, isr20),
        (21, isr21),
        (22, isr22),
        (23, isr23),
        (24, isr24),
        (25, isr25),
        (26, isr26),
        (27, isr27),
        (28, isr28),
        (29, isr29),
        (30, isr30),
        (31, isr31),
    ]
}

/// (vector, stub address) for the 16 legacy IRQ vectors.
#[cfg(target_arch = "x86")]
pub fn irq_stubs() -> [(u8, u32); 16] {
    stub_entries![
        (32, irq0),
        (33, irq1),
        (34, irq2),
        (35, irq3),
        (36, irq4),
        (37, irq5),
        (38, irq6),
        (39, irq7),
        (40, irq8),
        (41, irq9),
        (42, irq10),
        (43, irq11),
        (44, irq12),
        (45, irq13),
        (46, irq14),
        (47, irq15),
    ]
}

#[cfg(target_arch = "x86")]
pub fn spurious_stub() -> u32 {
    extern "C" {
        fn intr63();
    }
    intr63 as usize as u32
}

#[cfg(target_arch = "x86")]
pub fn timer_stub() -> u32 {
    extern "C" {
        fn intr64();
    }
    intr64 as usize as u32
}

#[cfg(target_arch = "x86")]
pub fn error_stub() -> u32 {
    extern "C" {
        fn intr65();
    }
    intr65 as usize as u32
}

#[cfg(target_arch = "x86")]
pub fn syscall_stub() -> u32 {
    extern "C" {
        fn isr128();
    }
    isr128 as usize as u32
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_is_sixty_eight_bytes() {
        assert_eq!(REGISTERS_FRAME_SIZE, 68);
        assert_eq!(core::mem::offset_of!(Registers, gs), 0);
        assert_eq!(core::mem::offset_of!(Registers, edi), 16);
        assert_eq!(core::mem::offset_of!(Registers, int_no), 48);
        assert_eq!(core::mem::offset_of!(Registers, eip), 56);
        assert_eq!(core::mem::offset_of!(Registers, eflags), 64);
    }

    #[test]
    fn eoi_classification() {
        assert!(needs_lapic_eoi(IRQ0));
        assert!(needs_lapic_eoi(IRQ15));
        assert!(needs_lapic_eoi(IRQ_TIMER));
        assert!(needs_lapic_eoi(IRQ_ERROR));
        assert!(!needs_lapic_eoi(IRQ_SPURIOUS));
        assert!(!needs_lapic_eoi(VECTOR_PAGE_FAULT));
        assert!(!needs_lapic_eoi(VECTOR_SYSCALL));

        assert!(needs_pic_eoi(IRQ_KEYBOARD));
        assert!(!needs_pic_eoi(IRQ_TIMER));
    }

    #[test]
    fn handlers_register_and_reset() {
        fn nop(regs: &mut Registers) -> u32 {
            regs as *mut Registers as u32
        }

        install();
        assert!(lookup(IRQ_SPURIOUS).is_some(), "spurious pre-registered");
        assert!(lookup(VECTOR_PAGE_FAULT).is_none());

        register_interrupt_handler(VECTOR_PAGE_FAULT, nop);
        assert!(lookup(VECTOR_PAGE_FAULT).is_some());

        install();
        assert!(lookup(VECTOR_PAGE_FAULT).is_none(), "install resets");
    }
}
