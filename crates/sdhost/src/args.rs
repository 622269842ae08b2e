use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sdhost_hw::specs::clock::{CORE_HZ, DEFAULT_SPEED_HZ};
use sdhost_hw::specs::timing::POLL_RETRY_COUNT;

use crate::clock::MAX_TARGET_HZ;
use crate::{HostConfig, PollPolicy, StdPlatform};

#[derive(Parser, Debug, Clone)]
#[command(about = "Drive a simulated BCM283x SDHost controller over an SD card image")]
pub struct Args {
    /// Path to SD card image (raw disk image, MBR partitioned or bare FAT)
    pub image: PathBuf,

    /// Controller identifier used in diagnostics
    #[arg(long, default_value_t = 1)]
    pub id: u32,

    /// Core clock reported by the platform (hex: 0x1234 or decimal: 1234)
    #[arg(long, value_parser = parse_hex_or_dec, default_value_t = u64::from(CORE_HZ))]
    pub core_clock_hz: u64,

    /// SD clock programmed once identification completes
    #[arg(long, value_parser = parse_hex_or_dec, default_value_t = u64::from(DEFAULT_SPEED_HZ))]
    pub sd_clock_hz: u64,

    /// Register polls before a wait times out
    #[arg(long, default_value_t = POLL_RETRY_COUNT)]
    pub poll_retries: u32,

    /// Hex dump this block (hex: 0x1234 or decimal: 1234)
    #[arg(long, value_parser = parse_hex_or_dec)]
    pub dump_sector: Option<u64>,

    /// List the root directory of the FAT volume
    #[arg(long, short = 'l')]
    pub list: bool,

    /// Extract this file from the FAT volume (path relative to its root)
    #[arg(long)]
    pub extract: Option<String>,

    /// Where to write the extracted file. Defaults to stdout.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

impl Args {
    /// Validate that the arguments are consistent
    pub fn validate(&self) -> Result<(), String> {
        if self.output.is_some() && self.extract.is_none() {
            return Err("--output requires --extract to be specified".to_string());
        }
        if self.poll_retries == 0 {
            return Err("--poll-retries must be at least 1".to_string());
        }
        if self.sd_clock_hz == 0 {
            return Err("--sd-clock-hz must not be zero".to_string());
        }
        if u32::try_from(self.core_clock_hz).is_err() {
            return Err("--core-clock-hz must fit in 32 bits".to_string());
        }
        if self.sd_clock_hz > u64::from(MAX_TARGET_HZ) {
            return Err(format!("--sd-clock-hz must not exceed {MAX_TARGET_HZ}"));
        }
        Ok(())
    }

    /// Convert Args to HostConfig
    pub fn to_host_config(&self) -> HostConfig {
        let defaults = HostConfig::default();
        HostConfig {
            id: self.id,
            poll: PollPolicy {
                retries: self.poll_retries,
                ..defaults.poll
            },
            stabilize: defaults.stabilize,
        }
    }

    pub fn to_platform(&self) -> StdPlatform {
        StdPlatform::new(self.core_clock_hz as u32)
    }

    pub fn sd_clock_hz(&self) -> u32 {
        self.sd_clock_hz as u32
    }

    /// Total polling budget of a single wait
    pub fn poll_budget(&self) -> Duration {
        self.to_host_config().poll.wait * self.poll_retries
    }
}

pub fn parse_hex_or_dec(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("sdhost-cli").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_match_hardware_constants() {
        let args = parse(&["card.img"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.to_host_config(), HostConfig::default());
        assert_eq!(args.sd_clock_hz(), 25_000_000);
        assert_eq!(args.poll_budget(), Duration::from_millis(20_000));
    }

    #[test]
    fn flags_map_to_host_config() {
        let args = parse(&["card.img", "--id", "2", "--poll-retries", "500", "--dump-sector", "0x10"]);
        let config = args.to_host_config();
        assert_eq!(config.id, 2);
        assert_eq!(config.poll.retries, 500);
        assert_eq!(config.poll.wait, Duration::from_micros(20));
        assert_eq!(args.dump_sector, Some(16));
    }

    #[test]
    fn output_requires_extract() {
        let args = parse(&["card.img", "-o", "out.bin"]);
        assert!(args.validate().is_err());

        let args = parse(&["card.img", "--extract", "BOOT.TXT", "-o", "out.bin"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn sd_clock_must_fit_the_divider_math() {
        assert!(parse(&["card.img", "--sd-clock-hz", "3000000000"]).validate().is_err());
        assert!(parse(&["card.img", "--sd-clock-hz", "0x7FFFFFFF"]).validate().is_ok());
        assert!(parse(&["card.img", "--core-clock-hz", "0x100000000"]).validate().is_err());
    }

    #[test]
    fn hex_and_decimal_values() {
        assert_eq!(parse_hex_or_dec("0x3F202000"), Ok(0x3F20_2000));
        assert_eq!(parse_hex_or_dec("250000000"), Ok(250_000_000));
        assert!(parse_hex_or_dec("0xZZ").is_err());
    }
}
