use crate::protocol::{status_request, FrameProgress, FrameReceiver, StatusReply};
use anyhow::{Context, Result};
use std::time::{Duration, Instant};

/// Minimum pause between two requests, the BMS drops requests that arrive
/// faster.
const MINIMUM_DELAY: Duration = Duration::from_millis(50);

/// Synchronous serial client for the JK BMS (115200 baud, 8N1).
pub struct JkBms {
    serial: Box<dyn serialport::SerialPort>,
    last_execution: Instant,
    delay: Duration,
}

impl JkBms {
    pub fn new(port: &str) -> Result<Self> {
        Ok(Self {
            serial: serialport::new(port, 115200)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()
                .with_context(|| format!("Cannot open serial port '{}'", port))?,
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.serial
            .set_timeout(timeout)
            .map_err(anyhow::Error::from)
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    /// Clears pending input and sends the "read all data" request.
    pub fn request_status(&mut self) -> Result<()> {
        // clear all incoming serial to avoid data collision
        loop {
            let pending = self
                .serial
                .bytes_to_read()
                .with_context(|| "Cannot read number of pending bytes")?;
            if pending > 0 {
                log::trace!("Got {} pending bytes", pending);
                let mut buf: Vec<u8> = vec![0; 64];
                let received = self
                    .serial
                    .read(buf.as_mut_slice())
                    .with_context(|| "Cannot read pending bytes")?;
                log::trace!("Read {} pending bytes", received);
            } else {
                break;
            }
        }
        self.serial_await_delay();

        self.serial
            .write_all(&status_request())
            .with_context(|| "Cannot write to serial")?;
        Ok(())
    }

    /// Reads whatever reply bytes are available into `buffer`.
    ///
    /// Used by the daemon, which runs its own frame receiver and needs the
    /// raw stream.
    pub fn read_available(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let received = self
            .serial
            .read(buffer)
            .with_context(|| "Cannot receive reply")?;
        self.last_execution = Instant::now();
        log::trace!("read_available: {:02X?}", &buffer[..received]);
        Ok(received)
    }

    /// Requests and receives one complete status reply.
    pub fn read_status(&mut self) -> Result<StatusReply> {
        self.request_status()?;
        let mut receiver = FrameReceiver::new();
        let mut byte = [0u8; 1];
        loop {
            self.serial
                .read_exact(&mut byte)
                .with_context(|| "Cannot receive reply")?;
            match receiver.consume(byte[0]) {
                Ok(FrameProgress::Pending) => {}
                Ok(FrameProgress::Complete) => {
                    self.last_execution = Instant::now();
                    return StatusReply::decode(receiver.frame())
                        .with_context(|| "Cannot decode status reply");
                }
                Err(error) => {
                    log::trace!("Resynchronizing: {}", error);
                    receiver.reset();
                    if receiver.consume(byte[0]).is_err() {
                        receiver.reset();
                    }
                }
            }
        }
    }
}
