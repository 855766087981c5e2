//! Connection configuration knobs.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::GcsError;

/// Default maximum desired network packet size in bytes. Actions are
/// fragmented to this target; for best results it should be a multiple of
/// the path MTU.
pub const DEFAULT_PKT_SIZE: usize = 64_500;

/// Where the connection's log records go.
///
/// The variants are mutually exclusive by construction. When none is given
/// the facade installs a plain stderr sink.
#[derive(Clone)]
pub enum LogSink {
    /// Append formatted records to a file.
    File(PathBuf),
    /// Hand formatted records to the application.
    Callback(Arc<dyn Fn(&str) + Send + Sync>),
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSink::File(path) => f.debug_tuple("File").field(path).finish(),
            LogSink::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Connection configuration.
///
/// Every numeric/boolean knob is also reachable by name through
/// [`Config::param_set`], mirroring the string-keyed parameter surface of
/// the public API.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fragmentation target for outgoing actions.
    pub pkt_size: usize,
    /// Verbose logging.
    pub debug: bool,
    /// Timestamp log records in the installed sink.
    pub self_tstamp: bool,
    /// When flow-stopped, fail sends with `Overflow` instead of blocking.
    pub flow_nonblock: bool,
    /// Receive queue length above which this node broadcasts a flow-control
    /// stop.
    pub fc_upper_limit: usize,
    /// Receive queue length below which this node broadcasts a flow-control
    /// cont.
    pub fc_lower_limit: usize,
    /// Reassembly size cap; declared action sizes above it fail assembly.
    pub max_action_size: usize,
    /// Hard bound of the receive queue.
    pub recv_q_limit: usize,
    /// Log destination; `None` installs a stderr sink.
    pub log: Option<LogSink>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pkt_size: DEFAULT_PKT_SIZE,
            debug: false,
            self_tstamp: true,
            flow_nonblock: false,
            fc_upper_limit: 16,
            fc_lower_limit: 8,
            max_action_size: i32::MAX as usize,
            recv_q_limit: 4096,
            log: None,
        }
    }
}

impl Config {
    /// Set a knob by name.
    ///
    /// Unknown keys fail with [`GcsError::NotFound`], malformed values with
    /// [`GcsError::Protocol`]. The log sink is not reachable this way; it is
    /// fixed at create time.
    pub fn param_set(&mut self, key: &str, value: &str) -> Result<(), GcsError> {
        match key {
            "pkt_size" => {
                let v = parse_usize(key, value)?;
                if v == 0 {
                    return Err(GcsError::Protocol("pkt_size must be positive".into()));
                }
                self.pkt_size = v;
            }
            "debug" => self.debug = parse_bool(key, value)?,
            "self_tstamp" => self.self_tstamp = parse_bool(key, value)?,
            "flow_nonblock" => self.flow_nonblock = parse_bool(key, value)?,
            "fc_upper_limit" => self.fc_upper_limit = parse_usize(key, value)?,
            "fc_lower_limit" => self.fc_lower_limit = parse_usize(key, value)?,
            "max_action_size" => self.max_action_size = parse_usize(key, value)?,
            "recv_q_limit" => {
                let v = parse_usize(key, value)?;
                if v == 0 {
                    return Err(GcsError::Protocol("recv_q_limit must be positive".into()));
                }
                self.recv_q_limit = v;
            }
            _ => return Err(GcsError::NotFound(key.to_string())),
        }
        Ok(())
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, GcsError> {
    value
        .parse()
        .map_err(|_| GcsError::Protocol(format!("bad value '{value}' for {key}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, GcsError> {
    match value {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        _ => Err(GcsError::Protocol(format!("bad value '{value}' for {key}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.pkt_size, DEFAULT_PKT_SIZE);
        assert!(!config.debug);
        assert!(config.fc_lower_limit < config.fc_upper_limit);
    }

    #[test]
    fn param_set_known_keys() {
        let mut config = Config::default();
        config.param_set("pkt_size", "1500").unwrap();
        config.param_set("debug", "on").unwrap();
        config.param_set("flow_nonblock", "true").unwrap();
        assert_eq!(config.pkt_size, 1500);
        assert!(config.debug);
        assert!(config.flow_nonblock);
    }

    #[test]
    fn param_set_unknown_key() {
        let mut config = Config::default();
        assert_eq!(
            config.param_set("no_such_knob", "1"),
            Err(GcsError::NotFound("no_such_knob".into()))
        );
    }

    #[test]
    fn param_set_bad_values() {
        let mut config = Config::default();
        assert!(matches!(
            config.param_set("pkt_size", "many"),
            Err(GcsError::Protocol(_))
        ));
        assert!(matches!(
            config.param_set("pkt_size", "0"),
            Err(GcsError::Protocol(_))
        ));
        assert!(matches!(
            config.param_set("debug", "maybe"),
            Err(GcsError::Protocol(_))
        ));
    }
}
