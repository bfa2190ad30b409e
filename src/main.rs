use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use jkpylon_lib::bridge::Bridge;
use jkpylon_lib::protocol::StatusReply;
use jkpylon_lib::serialport::JkBms;
use log::*;
use std::{ops::Deref, panic, time::Instant};

mod commandline;
mod daemon;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn print_status(reply: &StatusReply) {
    println!("Device:          {}", reply.device_id_str());
    println!("Software:        {}", reply.software_version_str());
    println!("Chemistry:       {}", reply.chemistry);
    println!(
        "Voltage:         {:.2} V",
        reply.battery_10mv as f32 / 100.0
    );
    println!(
        "Current:         {:.2} A",
        reply.current_10ma as f32 / 100.0
    );
    println!("SOC (BMS):       {} %", reply.bms_soc_percent);
    println!("Cycles:          {}", reply.cycles);
    println!(
        "Capacity:        {} Ah (actual {} Ah)",
        reply.total_capacity_ah, reply.actual_capacity_ah
    );
    println!(
        "Temperatures:    MOSFET {} C, sensor 1 {} C, sensor 2 {} C",
        reply.temperature_mosfet, reply.temperature_sensor1, reply.temperature_sensor2
    );
    println!(
        "MOSFETs:         charge {}, discharge {}, balancer {}",
        reply.status.charge_mosfet_active(),
        reply.status.discharge_mosfet_active(),
        reply.status.balancer_active()
    );
    println!("Alarms:          0x{:04X}", reply.alarms.0);
    println!("Cells:           {}", reply.cell_count);
    for i in 0..reply.cell_count {
        println!("  Cell {:2}:       {} mV", i + 1, reply.cell_millivolt[i]);
    }
}

fn print_frames(bms: &mut JkBms) -> Result<()> {
    let mut bridge = Bridge::new();
    bms.request_status()?;
    let epoch = Instant::now();
    let mut buffer = [0u8; 512];
    loop {
        let received = bms
            .read_available(&mut buffer)
            .with_context(|| "Cannot read status reply")?;
        if bridge.feed(&buffer[..received]) > 0 {
            break;
        }
    }
    for frame in bridge.frames(epoch.elapsed().as_millis() as u64) {
        println!("0x{:03X} [{}] {:02X?}", frame.id, frame.len, frame.payload());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut bms = JkBms::new(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    bms.set_timeout(args.timeout)?;
    bms.set_delay(args.delay);

    match args.command {
        CliCommands::Status { json } => {
            let reply = bms.read_status().with_context(|| "Cannot read status")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reply)?);
            } else {
                print_status(&reply);
            }
        }
        CliCommands::Frames => print_frames(&mut bms)?,
        CliCommands::Run {
            can,
            interval,
            transmit_interval,
        } => daemon::run(bms, can, interval, transmit_interval)?,
    }

    Ok(())
}
