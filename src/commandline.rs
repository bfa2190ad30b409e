use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read one status reply and show the decoded BMS values
    Status {
        /// Print the reply as JSON instead of human readable text
        #[clap(long, action)]
        json: bool,
    },
    /// Read one status reply and show the resulting Pylontech CAN frames
    Frames,
    /// Run the bridge: poll the BMS and transmit the CAN frame set continuously
    Run {
        /// CAN interface to transmit on (e.g., "can0"). Without it the
        /// frames are printed to the standard output.
        #[clap(long)]
        can: Option<String>,
        /// Interval for polling the BMS (e.g., "2s", "500ms")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "2s")]
        interval: Duration,
        /// Interval for sending the CAN frame set (e.g., "1s")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "1s")]
        transmit_interval: Duration,
    },
}

const fn about_text() -> &'static str {
    "JK-BMS to Pylontech CAN bridge"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for serial I/O operations (e.g., "500ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "500ms")]
    pub timeout: Duration,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between sending multiple commands to the BMS (e.g., "50ms", "100ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "50ms")]
    pub delay: Duration,
}
