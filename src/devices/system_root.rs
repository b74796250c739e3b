// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! The synthetic root of the device tree and the machine's built-in debug
//! console.

use std::sync::{Arc, Mutex};

use log::info;

use crate::devices::resource::IoResource;
use crate::devices::Device;

/// The motherboard: a deviceless node that owns every functional device.
#[derive(Debug)]
pub struct SystemRoot {
    children: Vec<Arc<Mutex<dyn Device>>>,
}

impl SystemRoot {
    pub fn new(children: Vec<Arc<Mutex<dyn Device>>>) -> SystemRoot {
        SystemRoot { children }
    }
}

impl Device for SystemRoot {
    fn name(&self) -> &str {
        "system-root"
    }

    fn children(&self) -> Vec<Arc<Mutex<dyn Device>>> {
        self.children.clone()
    }
}

/// Port the BIOS debug console lives on.
pub const DEBUG_CONSOLE_PORT: u16 = 0x402;

/// Byte a read from the port returns so firmware can probe for the console.
const DEBUG_CONSOLE_PROBE: u8 = 0xe9;

const MAX_LINE: usize = 256;

/// SeaBIOS-style debug console: firmware writes log bytes to port 0x402 and
/// probes for the device by reading 0xE9 back.
#[derive(Debug, Default)]
pub struct DebugConsole {
    line: Vec<u8>,
}

impl DebugConsole {
    pub fn new() -> DebugConsole {
        DebugConsole::default()
    }

    fn flush(&mut self) {
        if !self.line.is_empty() {
            info!("debugcon: {}", String::from_utf8_lossy(&self.line));
            self.line.clear();
        }
    }
}

impl Device for DebugConsole {
    fn name(&self) -> &str {
        "debug-console"
    }

    fn io_resources(&self) -> Vec<IoResource> {
        vec![IoResource::pio(DEBUG_CONSOLE_PORT, 1, "debugcon")]
    }

    fn reset(&mut self) {
        self.line.clear();
    }

    fn read(&mut self, _resource: &IoResource, _offset: u64, data: &mut [u8]) {
        data.fill(DEBUG_CONSOLE_PROBE);
    }

    fn write(&mut self, _resource: &IoResource, _offset: u64, data: &[u8]) {
        for &byte in data {
            match byte {
                b'\n' => self.flush(),
                b'\r' => {}
                _ => {
                    self.line.push(byte);
                    if self.line.len() >= MAX_LINE {
                        self.flush();
                    }
                }
            }
        }
    }
}
