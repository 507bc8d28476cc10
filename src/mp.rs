// Narrow collaborator interfaces onto the platform's multiprocessor
// hardware: LAPIC timer/EOI/IPI, IOAPIC routing, and boot-time CPU
// discovery. MP-table/ACPI parsing and the actual MMIO register pokes
// live outside this crate, reached only through these functions, the way
// spec.md's §6 external-interfaces boundary draws it.

extern "C" {
    /// This CPU's local APIC ID, used as the index into proc.rs's per-CPU
    /// array. Valid only after the LAPIC has been mapped and initialized.
    fn lapic_id() -> u8;

    /// Acknowledge the interrupt currently being serviced.
    fn lapic_eoi();

    /// Arm the LAPIC's periodic timer to fire every `ticks` bus cycles.
    fn lapic_timer_init(ticks: u32);

    /// Send an INIT+STARTUP IPI sequence to boot an application processor
    /// at physical address `entry` (must be page-aligned, below 1MB).
    fn lapic_start_ap(apic_id: u8, entry: u32);

    /// Route IOAPIC input `irq` to vector `irq + IRQ_OFFSET`, targeting
    /// `cpu_id`; masked when `enabled` is false.
    fn ioapic_enable(irq: u8, cpu_id: u8, enabled: bool);

    /// Number of usable application processors discovered via the MP/ACPI
    /// tables, not counting the bootstrap processor.
    fn mp_ncpu() -> u8;
}

pub const IRQ_OFFSET: u8 = 32;
pub const IRQ_TIMER: u8 = 0;
pub const IRQ_KBD: u8 = 1;
pub const IRQ_IDE: u8 = 14;
pub const IRQ_ERROR: u8 = 19;
pub const IRQ_SPURIOUS: u8 = 31;

pub fn cpunum() -> usize {
    unsafe { lapic_id() as usize }
}

pub fn eoi() {
    unsafe { lapic_eoi() }
}

pub fn timer_init(ticks: u32) {
    unsafe { lapic_timer_init(ticks) }
}

pub fn start_ap(apic_id: u8, entry: u32) {
    unsafe { lapic_start_ap(apic_id, entry) }
}

pub fn ioapic_route(irq: u8, cpu_id: u8, enabled: bool) {
    unsafe { ioapic_enable(irq, cpu_id, enabled) }
}

pub fn ncpu() -> usize {
    unsafe { mp_ncpu() as usize + 1 }
}
