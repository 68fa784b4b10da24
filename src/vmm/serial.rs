// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Polled 16550 UART at COM1.
//!
//! Interrupts are never raised: the guest driver polls the line status
//! register. Output goes to the console socket, input comes from it.

use crate::device_manager::SerialSink;

pub const SERIAL_PORT_BASE: u16 = 0x3f8;
pub const SERIAL_PORT_END: u16 = 0x3ff;

// Serial port register offsets
const SERIAL_DATA: u16 = 0; // THR/RBR, DLL when DLAB is set
const SERIAL_IER: u16 = 1; // IER, DLM when DLAB is set
const SERIAL_IIR_FCR: u16 = 2;
const SERIAL_LCR: u16 = 3;
const SERIAL_MCR: u16 = 4;
const SERIAL_LSR: u16 = 5;
const SERIAL_MSR: u16 = 6;
const SERIAL_SCR: u16 = 7;

const LCR_DLAB: u8 = 0x80;
const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;
const LSR_IDLE: u8 = 0x40;
const IIR_NO_INTERRUPT: u8 = 0x01;
// carrier detect, data set ready, clear to send
const MSR_CONNECTED: u8 = 0xb0;
const IER_MASK: u8 = 0x0f;

/// Register state of one UART.
#[derive(Default)]
pub struct SerialPort {
    sink: Option<SerialSink>,
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    dll: u8,
    dlm: u8,
}

impl SerialPort {
    pub fn new(sink: Option<SerialSink>) -> Self {
        SerialPort {
            sink,
            // 9600 baud
            dll: 0x0c,
            ..Default::default()
        }
    }

    fn dlab(&self) -> bool {
        self.lcr & LCR_DLAB != 0
    }

    /// Whether `port` belongs to this UART.
    pub fn handles(port: u16) -> bool {
        (SERIAL_PORT_BASE..=SERIAL_PORT_END).contains(&port)
    }

    pub fn read(&mut self, offset: u16) -> u8 {
        match offset {
            SERIAL_DATA if self.dlab() => self.dll,
            SERIAL_DATA => self.sink.as_ref().and_then(|s| s.pop_input()).unwrap_or(0),
            SERIAL_IER if self.dlab() => self.dlm,
            SERIAL_IER => self.ier,
            SERIAL_IIR_FCR => IIR_NO_INTERRUPT,
            SERIAL_LCR => self.lcr,
            SERIAL_MCR => self.mcr,
            SERIAL_LSR => {
                let ready = self.sink.as_ref().map_or(false, |s| s.has_input());
                LSR_THR_EMPTY | LSR_IDLE | if ready { LSR_DATA_READY } else { 0 }
            }
            SERIAL_MSR => MSR_CONNECTED,
            SERIAL_SCR => self.scr,
            _ => 0xff,
        }
    }

    pub fn write(&mut self, offset: u16, value: u8) {
        match offset {
            SERIAL_DATA if self.dlab() => self.dll = value,
            SERIAL_DATA => {
                if let Some(sink) = self.sink.as_ref() {
                    sink.write_output(&[value]);
                }
            }
            SERIAL_IER if self.dlab() => self.dlm = value,
            SERIAL_IER => self.ier = value & IER_MASK,
            SERIAL_LCR => self.lcr = value,
            SERIAL_MCR => self.mcr = value,
            SERIAL_SCR => self.scr = value,
            // FIFO control, read-only registers
            _ => {}
        }
    }
}
