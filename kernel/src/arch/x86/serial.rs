//! 16550 serial console (COM1).
//!
//! The kernel's only output channel during bring-up. Polled writes; the
//! receive side belongs to the console driver, which is outside the core.

use core::fmt;

use spin::Mutex;

use super::asm::{inb, outb};

const COM1: u16 = 0x3F8;

const LSR_TX_EMPTY: u8 = 0x20;

struct SerialPort {
    initialized: bool,
}

static PORT: Mutex<SerialPort> = Mutex::new(SerialPort { initialized: false });

impl SerialPort {
    fn init(&mut self) {
        if self.initialized {
            return;
        }
        outb(COM1 + 1, 0x00); // disable interrupts
        outb(COM1 + 3, 0x80); // DLAB on
        outb(COM1, 0x01); // 115200 baud
        outb(COM1 + 1, 0x00);
        outb(COM1 + 3, 0x03); // 8n1, DLAB off
        outb(COM1 + 2, 0xC7); // FIFO on, cleared, 14-byte threshold
        outb(COM1 + 4, 0x0B);
        self.initialized = true;
    }

    fn write_byte(&mut self, byte: u8) {
        self.init();
        let mut spins = 0u32;
        while inb(COM1 + 5) & LSR_TX_EMPTY == 0 {
            spins += 1;
            if spins > 100_000 {
                return; // no serial hardware; drop the byte
            }
        }
        outb(COM1, byte);
    }
}

/// Handle that formats into the serial port.
pub struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut port = PORT.lock();
        for byte in s.bytes() {
            if byte == b'\n' {
                port.write_byte(b'\r');
            }
            port.write_byte(byte);
        }
        Ok(())
    }
}

/// Writer for the print macros.
pub fn writer() -> SerialWriter {
    SerialWriter
}
