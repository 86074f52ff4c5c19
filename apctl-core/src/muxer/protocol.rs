//! Parses the radio daemon's unsolicited status messages.
//!
//! A single regex per message family, as required: no ad-hoc string
//! switching scattered across the muxer and station tracker.

use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationEvent {
    Connected(String),
    PollOk(String),
    Disconnected(String),
    BadPassword(String),
    EapRetransmit(String),
}

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^<\d+>
        (?:
            AP-STA-CONNECTED\s+(?P<connected>[0-9a-fA-F:]+)
          | AP-STA-POLL-OK\s+(?P<poll_ok>[0-9a-fA-F:]+)
          | AP-STA-DISCONNECTED\s+(?P<disconnected>[0-9a-fA-F:]+)
          | AP-STA-POSSIBLE-PSK-MISMATCH\s+(?P<psk_mismatch>[0-9a-fA-F:]+)
          | CTRL-EVENT-EAP-FAILURE2\s+(?P<eap_failure>[0-9a-fA-F:]+)
          | CTRL-EVENT-EAP-RETRANSMIT2?\s+(?P<eap_retransmit>[0-9a-fA-F:]+)
        )",
    )
    .expect("status regex is valid")
});

/// Parses one line from the control socket into a tagged [`StationEvent`],
/// or `None` if the line is not an unsolicited status message we recognize
/// (including anything not prefixed with `<`).
pub fn parse_status(line: &str) -> Option<StationEvent> {
    if !line.starts_with('<') {
        return None;
    }
    let caps = STATUS_RE.captures(line)?;
    if let Some(m) = caps.name("connected") {
        return Some(StationEvent::Connected(m.as_str().to_lowercase()));
    }
    if let Some(m) = caps.name("poll_ok") {
        return Some(StationEvent::PollOk(m.as_str().to_lowercase()));
    }
    if let Some(m) = caps.name("disconnected") {
        return Some(StationEvent::Disconnected(m.as_str().to_lowercase()));
    }
    if let Some(m) = caps.name("psk_mismatch") {
        return Some(StationEvent::BadPassword(m.as_str().to_lowercase()));
    }
    if let Some(m) = caps.name("eap_failure") {
        return Some(StationEvent::BadPassword(m.as_str().to_lowercase()));
    }
    if let Some(m) = caps.name("eap_retransmit") {
        return Some(StationEvent::EapRetransmit(m.as_str().to_lowercase()));
    }
    None
}

/// Parses the `signal=<int>` field out of a `STA <mac>` response.
pub fn parse_signal(response: &str) -> Option<i32> {
    response.lines().find_map(|line| line.strip_prefix("signal=")?.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_status_family() {
        assert_eq!(
            parse_status("<3>AP-STA-CONNECTED aa:bb:cc:dd:ee:ff"),
            Some(StationEvent::Connected("aa:bb:cc:dd:ee:ff".into()))
        );
        assert_eq!(
            parse_status("<3>AP-STA-POLL-OK aa:bb:cc:dd:ee:ff"),
            Some(StationEvent::PollOk("aa:bb:cc:dd:ee:ff".into()))
        );
        assert_eq!(
            parse_status("<3>AP-STA-DISCONNECTED AA:BB:CC:DD:EE:FF"),
            Some(StationEvent::Disconnected("aa:bb:cc:dd:ee:ff".into()))
        );
        assert_eq!(
            parse_status("<3>AP-STA-POSSIBLE-PSK-MISMATCH aa:bb:cc:dd:ee:ff"),
            Some(StationEvent::BadPassword("aa:bb:cc:dd:ee:ff".into()))
        );
        assert_eq!(
            parse_status("<3>CTRL-EVENT-EAP-FAILURE2 aa:bb:cc:dd:ee:ff"),
            Some(StationEvent::BadPassword("aa:bb:cc:dd:ee:ff".into()))
        );
        assert_eq!(
            parse_status("<3>CTRL-EVENT-EAP-RETRANSMIT2 aa:bb:cc:dd:ee:ff"),
            Some(StationEvent::EapRetransmit("aa:bb:cc:dd:ee:ff".into()))
        );
    }

    #[test]
    fn non_status_lines_are_ignored() {
        assert_eq!(parse_status("OK"), None);
        assert_eq!(parse_status("FAIL"), None);
    }

    #[test]
    fn parse_signal_extracts_integer_field() {
        let resp = "aa:bb:cc:dd:ee:ff\nsignal=-47\nrx_packets=100\n";
        assert_eq!(parse_signal(resp), Some(-47));
        assert_eq!(parse_signal("no such field"), None);
    }
}
