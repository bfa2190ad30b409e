use crate::pylontech::{CanFrame, CanSink};
use anyhow::{Context, Result};
use socketcan::{EmbeddedFrame, Socket, StandardId};
use std::io;

/// [`CanSink`] backed by a Linux SocketCAN interface.
pub struct CanBus {
    socket: socketcan::CanSocket,
}

impl CanBus {
    pub fn new(interface: &str) -> Result<Self> {
        Ok(Self {
            socket: socketcan::CanSocket::open(interface)
                .with_context(|| format!("Cannot open CAN interface '{}'", interface))?,
        })
    }
}

impl CanSink for CanBus {
    fn transmit(&mut self, frame: &CanFrame) -> io::Result<()> {
        let id = StandardId::new(frame.id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "CAN id out of range"))?;
        let can_frame = socketcan::CanFrame::new(id, frame.payload())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "CAN payload too long"))?;
        log::trace!("transmit: 0x{:03X} {:02X?}", frame.id, frame.payload());
        self.socket.write_frame(&can_frame)
    }
}
