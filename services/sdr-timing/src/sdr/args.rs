//! Device argument strings
//!
//! Devices are addressed with `key=value` pairs separated by commas, e.g.
//! `driver=rtlsdr,index=0`, `remote=192.168.1.20:1234` or
//! `driver=synthetic,tones=100000:0|-250000:-10`. Several devices are
//! separated by `;`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::block::SourceId;

/// Errors in a device argument string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgsError {
    #[error("malformed device argument '{0}' (expected key=value)")]
    Malformed(String),
    #[error("unknown driver '{0}'")]
    UnknownDriver(String),
    #[error("invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("missing required argument '{0}'")]
    Missing(&'static str),
}

/// Driver backing a sample source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// Local RTL-SDR through the rtl_sdr tool
    RtlSdr,
    /// Remote RTL-SDR served by rtl_tcp
    RtlTcp,
    /// Generated tones and noise
    Synthetic,
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Driver::RtlSdr => "rtlsdr",
            Driver::RtlTcp => "rtltcp",
            Driver::Synthetic => "synthetic",
        })
    }
}

/// Parsed device argument string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceArgs {
    driver: Driver,
    params: BTreeMap<String, String>,
}

impl DeviceArgs {
    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parse an optional typed parameter
    pub fn parse_param<T: FromStr>(&self, key: &str) -> Result<Option<T>, ArgsError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| ArgsError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Stable identifier for the stream this device produces
    pub fn source_id(&self) -> SourceId {
        if let Some(label) = self.get("label") {
            return SourceId::new(label);
        }
        match self.driver {
            Driver::RtlSdr => SourceId::new(format!("rtlsdr:{}", self.get("index").unwrap_or("0"))),
            Driver::RtlTcp => SourceId::new(format!("rtltcp:{}", self.get("remote").unwrap_or("?"))),
            Driver::Synthetic => {
                SourceId::new(format!("synthetic:{}", self.get("seed").unwrap_or("0")))
            }
        }
    }

    /// Parse a `;`-separated list of device argument strings
    pub fn parse_list(list: &str) -> Result<Vec<DeviceArgs>, ArgsError> {
        list.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for DeviceArgs {
    type Err = ArgsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut params = BTreeMap::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| ArgsError::Malformed(part.to_string()))?;
            params.insert(key.trim().to_lowercase(), value.trim().to_string());
        }

        let driver = match params.get("driver").map(String::as_str) {
            Some("rtlsdr") => Driver::RtlSdr,
            Some("rtltcp") | Some("remote") => Driver::RtlTcp,
            Some("synthetic") => Driver::Synthetic,
            Some(other) => return Err(ArgsError::UnknownDriver(other.to_string())),
            None if params.contains_key("remote") => Driver::RtlTcp,
            None => Driver::RtlSdr,
        };

        if driver == Driver::RtlTcp && !params.contains_key("remote") {
            return Err(ArgsError::Missing("remote"));
        }

        Ok(Self { driver, params })
    }
}

impl fmt::Display for DeviceArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver={}", self.driver)?;
        for (key, value) in self.params.iter().filter(|(k, _)| k.as_str() != "driver") {
            write!(f, ",{}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rtlsdr_default() {
        let args: DeviceArgs = "index=1, ppm=-3".parse().unwrap();
        assert_eq!(args.driver(), Driver::RtlSdr);
        assert_eq!(args.parse_param::<u32>("index").unwrap(), Some(1));
        assert_eq!(args.parse_param::<i32>("ppm").unwrap(), Some(-3));
        assert_eq!(args.source_id().as_str(), "rtlsdr:1");
    }

    #[test]
    fn test_remote_implies_rtltcp() {
        let args: DeviceArgs = "remote=10.0.0.5:1234".parse().unwrap();
        assert_eq!(args.driver(), Driver::RtlTcp);
        assert_eq!(args.get("remote"), Some("10.0.0.5:1234"));
        assert_eq!(args.source_id().as_str(), "rtltcp:10.0.0.5:1234");
    }

    #[test]
    fn test_label_overrides_id() {
        let args: DeviceArgs = "driver=synthetic,label=north".parse().unwrap();
        assert_eq!(args.source_id().as_str(), "north");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "driver=hackrf".parse::<DeviceArgs>(),
            Err(ArgsError::UnknownDriver("hackrf".into()))
        );
        assert_eq!(
            "driver=rtltcp".parse::<DeviceArgs>(),
            Err(ArgsError::Missing("remote"))
        );
        assert!(matches!(
            "index".parse::<DeviceArgs>(),
            Err(ArgsError::Malformed(_))
        ));

        let args: DeviceArgs = "index=abc".parse().unwrap();
        assert!(args.parse_param::<u32>("index").is_err());
    }

    #[test]
    fn test_parse_list() {
        let list = DeviceArgs::parse_list("driver=synthetic,seed=1; ;remote=host:1234;").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].driver(), Driver::Synthetic);
        assert_eq!(list[1].driver(), Driver::RtlTcp);
    }
}
