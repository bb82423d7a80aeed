//! ptp4l log line parsing
//!
//! ptp4l in `-m` mode prints lines like:
//!
//! ```text
//! ptp4l[5374.018]: master offset        -23 s2 freq   -1205 path delay       456
//! ptp4l[5375.018]: port 1: UNCALIBRATED to SLAVE on MASTER_CLOCK_SELECTED
//! ptp4l[5380.101]: selected best master clock 001122.fffe.334455
//! ```

use super::session::SyncEvent;
use super::state::OffsetSample;

/// Map one ptp4l output line to a session event
pub fn parse_ptp4l_line(line: &str) -> Option<SyncEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(sample) = parse_offset_line(line) {
        return Some(SyncEvent::Offset(sample));
    }

    if line.contains("to FAULTY") {
        return Some(SyncEvent::PeerUnreachable);
    }

    if line.contains("to SLAVE")
        || line.contains("to UNCALIBRATED")
        || line.contains("to MASTER")
        || line.contains("to GRAND_MASTER")
        || line.contains("selected best master clock")
        || line.contains("assuming the grand master role")
    {
        return Some(SyncEvent::PeerDiscovered);
    }

    if reports_unsupported_hardware(line) {
        return Some(SyncEvent::HardwareUnsupported);
    }

    None
}

fn reports_unsupported_hardware(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("does not support")
        || lower.contains("siocshwtstamp failed")
        || lower.contains("no such device")
        || (lower.contains("timestamping") && lower.contains("not supported"))
}

/// `master offset <ns> s<N> freq <ppb> path delay <ns>`
fn parse_offset_line(line: &str) -> Option<OffsetSample> {
    let rest = &line[line.find("master offset")? + "master offset".len()..];
    let mut tokens = rest.split_whitespace();

    let offset_ns: i64 = tokens.next()?.parse().ok()?;
    let servo = tokens.next()?;
    let servo_state: u8 = servo.strip_prefix('s')?.parse().ok()?;

    let mut path_delay_ns = 0;
    while let Some(token) = tokens.next() {
        if token == "delay" {
            path_delay_ns = tokens.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            break;
        }
    }

    Some(OffsetSample {
        offset_ns,
        path_delay_ns,
        locked: servo_state == 2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_master_offset() {
        let event =
            parse_ptp4l_line("ptp4l[5374.018]: master offset        -23 s2 freq   -1205 path delay       456");
        assert_eq!(
            event,
            Some(SyncEvent::Offset(OffsetSample {
                offset_ns: -23,
                path_delay_ns: 456,
                locked: true
            }))
        );
    }

    #[test]
    fn test_unlocked_servo_state() {
        match parse_ptp4l_line("ptp4l[10.0]: master offset 123456 s1 freq +0 path delay 800") {
            Some(SyncEvent::Offset(sample)) => {
                assert!(!sample.locked);
                assert_eq!(sample.offset_ns, 123456);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_port_transitions() {
        assert_eq!(
            parse_ptp4l_line("ptp4l[5.1]: port 1: UNCALIBRATED to SLAVE on MASTER_CLOCK_SELECTED"),
            Some(SyncEvent::PeerDiscovered)
        );
        assert_eq!(
            parse_ptp4l_line("ptp4l[5.1]: port 1: LISTENING to MASTER on ANNOUNCE_RECEIPT_TIMEOUT_EXPIRES"),
            Some(SyncEvent::PeerDiscovered)
        );
        assert_eq!(
            parse_ptp4l_line("ptp4l[5.1]: assuming the grand master role"),
            Some(SyncEvent::PeerDiscovered)
        );
        assert_eq!(
            parse_ptp4l_line("ptp4l[9.9]: port 1: SLAVE to FAULTY on FAULT_DETECTED (FT_UNSPECIFIED)"),
            Some(SyncEvent::PeerUnreachable)
        );
    }

    #[test]
    fn test_hardware_unsupported() {
        assert_eq!(
            parse_ptp4l_line("interface 'eth0' does not support requested timestamping mode"),
            Some(SyncEvent::HardwareUnsupported)
        );
        assert_eq!(
            parse_ptp4l_line("ioctl SIOCSHWTSTAMP failed: Operation not supported"),
            Some(SyncEvent::HardwareUnsupported)
        );
    }

    #[test]
    fn test_unrelated_lines() {
        assert_eq!(parse_ptp4l_line(""), None);
        assert_eq!(parse_ptp4l_line("ptp4l[1.0]: port 1: INITIALIZING to LISTENING on INIT_COMPLETE"), None);
        assert_eq!(parse_ptp4l_line("ptp4l[1.0]: master offset abc s2"), None);
    }
}
