use anyhow::{Context, Result};
use jkpylon_lib::bridge::Bridge;
use jkpylon_lib::can::CanBus;
use jkpylon_lib::pylontech::CanSink;
use jkpylon_lib::serialport::JkBms;
use log::{error, info, warn};
use std::time::{Duration, Instant};

/// Consecutive failed polls before the CAN frames degrade to failsafe
/// values.
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Read chunks per poll before giving up on finding a frame.
const MAX_READS_PER_POLL: u32 = 32;

struct ConsoleSink;

impl CanSink for ConsoleSink {
    fn transmit(&mut self, frame: &jkpylon_lib::pylontech::CanFrame) -> std::io::Result<()> {
        println!("0x{:03X} [{}] {:02X?}", frame.id, frame.len, frame.payload());
        Ok(())
    }
}

fn poll_once(bms: &mut JkBms, bridge: &mut Bridge) -> Result<bool> {
    bms.request_status()?;
    let mut buffer = [0u8; 512];
    for _ in 0..MAX_READS_PER_POLL {
        let received = bms.read_available(&mut buffer)?;
        if bridge.feed(&buffer[..received]) > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn run(
    mut bms: JkBms,
    can_interface: Option<String>,
    interval: Duration,
    transmit_interval: Duration,
) -> Result<()> {
    info!(
        "Starting bridge: can={can_interface:?}, interval={interval:?}, transmit_interval={transmit_interval:?}"
    );
    let mut sink: Box<dyn CanSink> = match &can_interface {
        Some(interface) => Box::new(
            CanBus::new(interface)
                .with_context(|| format!("Cannot open CAN interface '{interface}'"))?,
        ),
        None => Box::new(ConsoleSink),
    };

    let mut bridge = Bridge::new();
    let epoch = Instant::now();
    let mut next_poll = Instant::now();
    let mut next_transmit = Instant::now() + transmit_interval;
    let mut consecutive_timeouts = 0u32;
    let mut have_data = false;

    loop {
        let now = Instant::now();

        if now >= next_poll {
            next_poll = now + interval;
            match poll_once(&mut bms, &mut bridge) {
                Ok(true) => {
                    if consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                        info!("BMS answering again");
                    }
                    consecutive_timeouts = 0;
                    have_data = true;
                }
                Ok(false) => {
                    consecutive_timeouts += 1;
                    warn!("No reply from BMS ({consecutive_timeouts} in a row)");
                }
                Err(e) => {
                    consecutive_timeouts += 1;
                    error!("Poll failed ({consecutive_timeouts} in a row): {e:#}");
                }
            }
            if consecutive_timeouts == MAX_CONSECUTIVE_TIMEOUTS {
                warn!("BMS not answering, sending failsafe values");
                bridge.on_timeout();
            }
        }

        if now >= next_transmit {
            next_transmit = now + transmit_interval;
            // Nothing meaningful to send before the first reply arrived.
            if have_data {
                let now_ms = epoch.elapsed().as_millis() as u64;
                if let Err(e) = bridge.transmit(sink.as_mut(), now_ms) {
                    error!("CAN transmit failed: {e}");
                }
            }
        }

        let wakeup = next_poll.min(next_transmit);
        if let Some(pause) = wakeup.checked_duration_since(Instant::now()) {
            std::thread::sleep(pause);
        }
    }
}
