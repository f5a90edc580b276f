use crate::capture::RetryPolicy;
use crate::encoder::ByteOrder;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// The device node read when none is given.
pub const DEFAULT_DEVICE: &str = "/dev/input/event4";

/// Stream key events from an input device to stdout as 3-byte records.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "keypipe", version, about)]
pub struct Config {
    /// The evdev device node to capture from.
    #[arg(env = "KEYPIPE_DEVICE", default_value = DEFAULT_DEVICE)]
    pub device: PathBuf,

    /// Byte order of the key code in each output record.
    #[arg(long, env = "KEYPIPE_BYTE_ORDER", value_enum, default_value_t = ByteOrder::Native)]
    pub byte_order: ByteOrder,

    /// How many times a transient read error is retried before giving up.
    #[arg(long, env = "KEYPIPE_READ_RETRIES", default_value_t = 0)]
    pub read_retries: u32,

    /// Delay between read retries, in milliseconds.
    #[arg(long, env = "KEYPIPE_RETRY_DELAY_MS", default_value_t = 10)]
    pub retry_delay_ms: u64,

    /// Leave the terminal attributes alone.
    #[arg(long)]
    pub keep_terminal: bool,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.read_retries,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["keypipe"]).unwrap();
        assert_eq!(config.device, PathBuf::from(DEFAULT_DEVICE));
        assert_eq!(config.byte_order, ByteOrder::Native);
        assert_eq!(config.retry_policy(), RetryPolicy::none());
        assert!(!config.keep_terminal);
    }

    #[test]
    fn explicit_options() {
        let config = Config::try_parse_from([
            "keypipe",
            "/dev/input/event7",
            "--byte-order",
            "little",
            "--read-retries",
            "3",
            "--retry-delay-ms",
            "50",
            "--keep-terminal",
        ])
        .unwrap();

        assert_eq!(config.device, PathBuf::from("/dev/input/event7"));
        assert_eq!(config.byte_order, ByteOrder::Little);
        assert_eq!(
            config.retry_policy(),
            RetryPolicy {
                max_retries: 3,
                delay: Duration::from_millis(50)
            }
        );
        assert!(config.keep_terminal);
    }

    #[test]
    fn rejects_unknown_byte_order() {
        assert!(Config::try_parse_from(["keypipe", "--byte-order", "middle"]).is_err());
    }
}
