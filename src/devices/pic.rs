//! 8259 PIC Emulation
//!
//! Master/slave pair wired through the IRQ2 cascade, feeding the ExtINT
//! path of the injection pipeline. Edge IRQs latch on the rising edge;
//! level IRQs (per ELCR) follow the line, so a request masked while
//! asserted is redelivered when unmasked.
//!
//! Master: ports 0x20-0x21, IRQ 0-7. Slave: ports 0xA0-0xA1, IRQ 8-15.
//! ELCR: ports 0x4D0-0x4D1.

/// ICW initialization sequence state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Normal,
    WaitIcw2,
    WaitIcw3,
    WaitIcw4,
}

/// One 8259 chip.
#[derive(Debug)]
struct Pic8259Chip {
    /// Pending requests
    irr: u8,
    /// In service
    isr: u8,
    /// Masked
    imr: u8,
    /// Vector base (ICW2)
    vector_offset: u8,
    /// Level-triggered pins (ELCR)
    elcr: u8,
    /// Line state per pin
    lines: u8,
    init_state: InitState,
    icw4_needed: bool,
    auto_eoi: bool,
    special_mask: bool,
    /// OCW3 read selector: ISR instead of IRR
    read_isr: bool,
    /// Rotate priority on automatic EOI
    rotate_on_aeoi: bool,
    /// Rotation base: this pin has lowest priority
    lowest_prio: u8,
}

impl Pic8259Chip {
    fn new() -> Self {
        Self {
            irr: 0,
            isr: 0,
            imr: 0xFF,
            vector_offset: 0,
            elcr: 0,
            lines: 0,
            init_state: InitState::Normal,
            icw4_needed: false,
            auto_eoi: false,
            special_mask: false,
            read_isr: false,
            rotate_on_aeoi: false,
            lowest_prio: 7,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn is_level(&self, pin: u8) -> bool {
        self.elcr & (1 << pin) != 0
    }

    fn set_line(&mut self, pin: u8, asserted: bool) {
        debug_assert!(pin < 8);
        let bit = 1u8 << pin;
        let was = self.lines & bit != 0;
        if asserted {
            self.lines |= bit;
            if self.is_level(pin) || !was {
                self.irr |= bit;
            }
        } else {
            self.lines &= !bit;
            if self.is_level(pin) {
                // Level requests follow the line
                self.irr &= !bit;
            }
        }
    }

    /// Highest-priority serviceable pin, honoring rotation, IMR, and the
    /// priority fence from in-service pins (unless special mask mode).
    fn highest_pending(&self) -> Option<u8> {
        let base = (self.lowest_prio + 1) & 7;
        for i in 0..8 {
            let pin = (base + i) & 7;
            let bit = 1u8 << pin;
            // An in-service pin fences lower-priority requests
            if !self.special_mask && self.isr != 0 {
                let mut fence = None;
                for j in 0..8 {
                    let p = (base + j) & 7;
                    if self.isr & (1 << p) != 0 {
                        fence = Some(j);
                        break;
                    }
                }
                if let Some(f) = fence {
                    if i >= f {
                        return None;
                    }
                }
            }
            if self.irr & bit != 0 && self.imr & bit == 0 {
                return Some(pin);
            }
        }
        None
    }

    /// INTA cycle for `pin`: move to in-service, clear edge requests.
    fn ack(&mut self, pin: u8) {
        let bit = 1u8 << pin;
        if self.auto_eoi {
            self.rotate_if(self.rotate_on_aeoi, pin);
        } else {
            self.isr |= bit;
        }
        if !self.is_level(pin) {
            self.irr &= !bit;
        }
    }

    fn rotate_if(&mut self, rotate: bool, pin: u8) {
        if rotate {
            self.lowest_prio = pin;
        }
    }

    /// Non-specific EOI: retire the highest-priority in-service pin.
    fn eoi(&mut self, rotate: bool) {
        let base = (self.lowest_prio + 1) & 7;
        for i in 0..8 {
            let pin = (base + i) & 7;
            if self.isr & (1 << pin) != 0 {
                self.isr &= !(1 << pin);
                self.rotate_if(rotate, pin);
                return;
            }
        }
    }

    fn specific_eoi(&mut self, pin: u8, rotate: bool) {
        self.isr &= !(1 << pin);
        self.rotate_if(rotate, pin);
    }

    fn write_command(&mut self, value: u8) {
        if value & 0x10 != 0 {
            // ICW1
            self.icw4_needed = value & 0x01 != 0;
            self.init_state = InitState::WaitIcw2;
            self.imr = 0;
            self.isr = 0;
            self.irr = 0;
            self.lowest_prio = 7;
            self.special_mask = false;
            self.auto_eoi = false;
        } else if value & 0x08 != 0 {
            // OCW3
            if value & 0x02 != 0 {
                self.read_isr = value & 0x01 != 0;
            }
            if value & 0x40 != 0 {
                self.special_mask = value & 0x20 != 0;
            }
        } else {
            // OCW2
            let rotate = value & 0x80 != 0;
            let specific = value & 0x40 != 0;
            let eoi = value & 0x20 != 0;
            let pin = value & 0x07;
            match (rotate, specific, eoi) {
                (_, true, true) => self.specific_eoi(pin, rotate),
                (_, false, true) => self.eoi(rotate),
                (true, true, false) => self.lowest_prio = pin,
                (rot, false, false) => self.rotate_on_aeoi = rot,
                (false, true, false) => {}
            }
        }
    }

    fn write_data(&mut self, value: u8) {
        match self.init_state {
            InitState::WaitIcw2 => {
                self.vector_offset = value & 0xF8;
                self.init_state = InitState::WaitIcw3;
            }
            InitState::WaitIcw3 => {
                self.init_state = if self.icw4_needed {
                    InitState::WaitIcw4
                } else {
                    InitState::Normal
                };
            }
            InitState::WaitIcw4 => {
                self.auto_eoi = value & 0x02 != 0;
                self.init_state = InitState::Normal;
            }
            InitState::Normal => {
                // OCW1: interrupt mask
                self.imr = value;
            }
        }
    }

    fn read_command(&self) -> u8 {
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    fn read_data(&self) -> u8 {
        self.imr
    }
}

/// Master/slave 8259 pair.
#[derive(Debug)]
pub struct DualPic {
    master: Pic8259Chip,
    slave: Pic8259Chip,
}

/// Slave output is cascaded into this master pin.
const CASCADE_PIN: u8 = 2;

pub const SPURIOUS_MASTER: u8 = 7;
pub const SPURIOUS_SLAVE: u8 = 15;

impl DualPic {
    pub fn new() -> Self {
        Self { master: Pic8259Chip::new(), slave: Pic8259Chip::new() }
    }

    pub fn reset(&mut self) {
        self.master.reset();
        self.slave.reset();
    }

    fn chip_for(&mut self, irq: u8) -> (&mut Pic8259Chip, u8) {
        if irq < 8 {
            (&mut self.master, irq)
        } else {
            (&mut self.slave, irq - 8)
        }
    }

    fn update_cascade(&mut self) {
        let slave_pending = self.slave.highest_pending().is_some();
        self.master.set_line(CASCADE_PIN, slave_pending);
    }

    /// Raise an interrupt line (0-15).
    pub fn assert_irq(&mut self, irq: u8) {
        assert!(irq < 16 && irq != CASCADE_PIN);
        let (chip, pin) = self.chip_for(irq);
        chip.set_line(pin, true);
        self.update_cascade();
    }

    /// Drop an interrupt line.
    pub fn deassert_irq(&mut self, irq: u8) {
        assert!(irq < 16 && irq != CASCADE_PIN);
        let (chip, pin) = self.chip_for(irq);
        chip.set_line(pin, false);
        self.update_cascade();
    }

    pub fn pulse_irq(&mut self, irq: u8) {
        self.assert_irq(irq);
        self.deassert_irq(irq);
    }

    /// True while the INTR line to the CPU is high.
    pub fn has_pending(&mut self) -> bool {
        self.update_cascade();
        self.master.highest_pending().is_some()
    }

    /// Vector that an INTA cycle would return, without acknowledging.
    pub fn pending_vector(&mut self) -> Option<u8> {
        self.update_cascade();
        let pin = self.master.highest_pending()?;
        if pin == CASCADE_PIN {
            let spin = self.slave.highest_pending()?;
            Some(self.slave.vector_offset + spin)
        } else {
            Some(self.master.vector_offset + pin)
        }
    }

    /// INTA cycle: acknowledge and return the vector. A request that
    /// vanished between INTR and INTA yields the spurious IRQ7 vector.
    pub fn intack(&mut self) -> u8 {
        self.update_cascade();
        match self.master.highest_pending() {
            Some(pin) if pin == CASCADE_PIN => {
                self.master.ack(CASCADE_PIN);
                match self.slave.highest_pending() {
                    Some(spin) => {
                        self.slave.ack(spin);
                        self.update_cascade();
                        self.slave.vector_offset + spin
                    }
                    None => self.slave.vector_offset + SPURIOUS_MASTER,
                }
            }
            Some(pin) => {
                self.master.ack(pin);
                self.master.vector_offset + pin
            }
            None => self.master.vector_offset + SPURIOUS_MASTER,
        }
    }

    // ------------------------------------------------------------------
    // Port I/O
    // ------------------------------------------------------------------

    pub fn handles_port(port: u16) -> bool {
        matches!(port, 0x20 | 0x21 | 0xA0 | 0xA1 | 0x4D0 | 0x4D1)
    }

    pub fn port_read(&mut self, port: u16) -> u8 {
        match port {
            0x20 => self.master.read_command(),
            0x21 => self.master.read_data(),
            0xA0 => self.slave.read_command(),
            0xA1 => self.slave.read_data(),
            0x4D0 => self.master.elcr,
            0x4D1 => self.slave.elcr,
            _ => 0xFF,
        }
    }

    pub fn port_write(&mut self, port: u16, value: u8) {
        match port {
            0x20 => self.master.write_command(value),
            0x21 => self.master.write_data(value),
            0xA0 => self.slave.write_command(value),
            0xA1 => self.slave.write_data(value),
            // IRQ0/1/2/8/13 are fixed edge; their ELCR bits never stick
            0x4D0 => self.master.elcr = value & 0xF8,
            0x4D1 => self.slave.elcr = value & 0xDE,
            _ => {}
        }
        self.update_cascade();
    }
}

impl Default for DualPic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Standard ICW sequence: master base 0x20, slave base 0x28.
    fn init_pics(pic: &mut DualPic) {
        pic.port_write(0x20, 0x11);
        pic.port_write(0x21, 0x20); // ICW2
        pic.port_write(0x21, 0x04); // ICW3: slave on IRQ2
        pic.port_write(0x21, 0x01); // ICW4
        pic.port_write(0xA0, 0x11);
        pic.port_write(0xA1, 0x28);
        pic.port_write(0xA1, 0x02);
        pic.port_write(0xA1, 0x01);
    }

    #[test]
    fn test_edge_interrupt_ack() {
        let mut pic = DualPic::new();
        init_pics(&mut pic);
        pic.pulse_irq(1);
        assert!(pic.has_pending());
        assert_eq!(pic.pending_vector(), Some(0x21));
        assert_eq!(pic.intack(), 0x21);
        assert!(!pic.has_pending());
        // IRQ1 now in service; ISR readable via OCW3
        pic.port_write(0x20, 0x0B);
        assert_eq!(pic.port_read(0x20), 0x02);
    }

    #[test]
    fn test_slave_cascade() {
        let mut pic = DualPic::new();
        init_pics(&mut pic);
        pic.pulse_irq(9);
        assert_eq!(pic.pending_vector(), Some(0x29));
        assert_eq!(pic.intack(), 0x29);
        // Both master (cascade) and slave have in-service bits
        pic.port_write(0x20, 0x0B);
        assert_eq!(pic.port_read(0x20), 1 << 2);
        pic.port_write(0xA0, 0x0B);
        assert_eq!(pic.port_read(0xA0), 1 << 1);
    }

    #[test]
    fn test_priority_fence() {
        let mut pic = DualPic::new();
        init_pics(&mut pic);
        pic.pulse_irq(3);
        assert_eq!(pic.intack(), 0x23);
        // Lower-priority request blocked while IRQ3 in service
        pic.pulse_irq(5);
        assert!(!pic.has_pending());
        // Higher priority gets through
        pic.pulse_irq(0);
        assert_eq!(pic.pending_vector(), Some(0x20));
        // Non-specific EOI retires IRQ3, unblocking IRQ5 after IRQ0
        pic.port_write(0x20, 0x20);
        assert_eq!(pic.intack(), 0x20);
        pic.port_write(0x20, 0x20);
        assert_eq!(pic.intack(), 0x25);
    }

    #[test]
    fn test_specific_eoi() {
        let mut pic = DualPic::new();
        init_pics(&mut pic);
        pic.pulse_irq(4);
        assert_eq!(pic.intack(), 0x24);
        pic.port_write(0x20, 0x60 | 4);
        pic.port_write(0x20, 0x0B);
        assert_eq!(pic.port_read(0x20), 0);
    }

    #[test]
    fn test_level_masked_latch() {
        let mut pic = DualPic::new();
        init_pics(&mut pic);
        pic.port_write(0x4D0, 1 << 5); // IRQ5 level-triggered
        pic.port_write(0x21, 1 << 5); // mask IRQ5
        pic.assert_irq(5);
        assert!(!pic.has_pending());
        // Unmask with the line still asserted: request redelivered
        pic.port_write(0x21, 0x00);
        assert_eq!(pic.pending_vector(), Some(0x25));
        // Level line deasserted: request withdrawn
        pic.deassert_irq(5);
        assert!(!pic.has_pending());
    }

    #[test]
    fn test_level_redelivery_after_eoi() {
        let mut pic = DualPic::new();
        init_pics(&mut pic);
        pic.port_write(0x4D0, 1 << 5);
        pic.assert_irq(5);
        assert_eq!(pic.intack(), 0x25);
        // Line still held at EOI: fires again
        pic.port_write(0x20, 0x20);
        assert!(pic.has_pending());
        pic.deassert_irq(5);
        assert!(!pic.has_pending());
    }

    #[test]
    fn test_spurious_vector() {
        let mut pic = DualPic::new();
        init_pics(&mut pic);
        assert_eq!(pic.intack(), 0x20 + SPURIOUS_MASTER);
    }

    #[test]
    fn test_masked_reset_state() {
        let mut pic = DualPic::new();
        // Before init all pins masked
        pic.assert_irq(1);
        assert!(!pic.has_pending());
    }
}
