//! Line protocol spoken with the init program inside the guest
//!
//! Guest to host, one record per console line:
//!
//! ```text
//! ##fcnode:state:<name>[ <detail>]
//! ##fcnode:stderr:<text>
//! ##fcnode:stdout:<text>
//! ##fcnode:system:<text>
//! <anything else>                  -> stdout
//! ```
//!
//! Host to guest there is a single command, [`SHUTDOWN_LINE`]. The guest
//! acknowledges it by powering off, which ends the hypervisor process.

use crate::models::LogRecord;

pub const PREFIX: &str = "##fcnode:";

/// Written to the serial console to ask the guest to power off
pub const SHUTDOWN_LINE: &[u8] = b"##fcnode:shutdown\n";

/// State names emitted by the stock guest init
pub mod states {
    pub const BOOTED: &str = "booted";
    pub const PULLING_IMAGE: &str = "pulling-image";
    pub const CONTAINER_STARTED: &str = "container-started";
    pub const CONTAINER_EXITED: &str = "container-exited";
    pub const SHUTTING_DOWN: &str = "shutting-down";
}

/// Parse one console line (terminator already stripped) into a record
pub fn parse_line(line: &str) -> LogRecord {
    let line = line.strip_suffix('\r').unwrap_or(line);

    let Some(body) = line.strip_prefix(PREFIX) else {
        return LogRecord::stdout(line);
    };

    if let Some(rest) = body.strip_prefix("state:") {
        let rest = rest.trim();
        if !rest.is_empty() {
            return match rest.split_once(' ') {
                Some((name, detail)) => {
                    let detail = detail.trim();
                    let detail = (!detail.is_empty()).then(|| detail.to_string());
                    LogRecord::state(name, detail)
                }
                None => LogRecord::state(rest, None),
            };
        }
    } else if let Some(text) = body.strip_prefix("stderr:") {
        return LogRecord::stderr(text);
    } else if let Some(text) = body.strip_prefix("stdout:") {
        return LogRecord::stdout(text);
    } else if let Some(text) = body.strip_prefix("system:") {
        return LogRecord::system(text);
    }

    // Malformed or unknown directive, keep it visible verbatim
    LogRecord::stdout(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogType;

    #[test]
    fn test_plain_line_is_stdout() {
        let record = parse_line("Listening on :80");
        assert_eq!(record.log_type, LogType::Stdout);
        assert_eq!(record.message.as_deref(), Some("Listening on :80"));
        assert!(record.state.is_none());
    }

    #[test]
    fn test_state_with_detail() {
        let record = parse_line("##fcnode:state:container-exited 137");
        assert_eq!(record.log_type, LogType::State);
        assert_eq!(record.state.as_deref(), Some(states::CONTAINER_EXITED));
        assert_eq!(record.message.as_deref(), Some("137"));
    }

    #[test]
    fn test_state_without_detail() {
        let record = parse_line("##fcnode:state:booted\r");
        assert!(record.is_state(states::BOOTED));
        assert!(record.message.is_none());
    }

    #[test]
    fn test_unknown_state_carried_verbatim() {
        let record = parse_line("##fcnode:state:warming-cache");
        assert!(record.is_state("warming-cache"));
    }

    #[test]
    fn test_stream_directives() {
        let err = parse_line("##fcnode:stderr:permission denied");
        assert_eq!(err.log_type, LogType::Stderr);
        assert_eq!(err.message.as_deref(), Some("permission denied"));

        let out = parse_line("##fcnode:stdout:");
        assert_eq!(out.log_type, LogType::Stdout);
        assert_eq!(out.message.as_deref(), Some(""));

        let sys = parse_line("##fcnode:system:init v2");
        assert_eq!(sys.log_type, LogType::System);
    }

    #[test]
    fn test_malformed_directive_is_stdout() {
        for line in ["##fcnode:state:", "##fcnode:bogus:x", "##fcnode:"] {
            let record = parse_line(line);
            assert_eq!(record.log_type, LogType::Stdout, "{}", line);
            assert_eq!(record.message.as_deref(), Some(line));
        }
    }

    #[test]
    fn test_shutdown_line() {
        assert!(SHUTDOWN_LINE.starts_with(PREFIX.as_bytes()));
        assert_eq!(SHUTDOWN_LINE.last(), Some(&b'\n'));
    }
}
