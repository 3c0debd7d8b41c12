//! The ASCII command/response wire format (spec §4.2, §6). This grammar and the
//! reply strings it produces are a byte-exact compatibility contract — do not
//! reformat without checking every caller.

use core::fmt;

/// Destination of a parsed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// `0` — "the node this command arrived on".
    SelfNode,
    /// `ALL` — the group address.
    All,
    /// A specific node id (`addr - base`).
    Node(u16),
}

/// The verb half of a parsed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Read,
    Duty(u8),
    Ramp,
    Stop,
    On,
    Off,
    Monitor,
}

impl Verb {
    /// The uppercase verb name, as used in `SENT:<verb>` acknowledgements.
    pub fn name(&self) -> &'static str {
        match self {
            Verb::Read => "READ",
            Verb::Duty(_) => "DUTY",
            Verb::Ramp => "RAMP",
            Verb::Stop => "STOP",
            Verb::On => "ON",
            Verb::Off => "OFF",
            Verb::Monitor => "MONITOR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedCommand {
    pub target: Target,
    pub verb: Verb,
}

/// Error tags from spec §6 — `Display` renders the exact `ERROR:<TAG>` string
/// (without any `:<detail>` suffix; callers append detail with [`format_error`]
/// when they have one).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("ERROR:NO_NODE_ID")]
    NoNodeId,
    #[error("ERROR:INVALID_NODE")]
    InvalidNode,
    #[error("ERROR:NO_COMMAND")]
    NoCommand,
    #[error("ERROR:UNKNOWN_CMD:{0}")]
    UnknownCmd(String),
    #[error("ERROR:MESH_SEND_FAIL")]
    MeshSendFail,
    #[error("ERROR:MESH_TIMEOUT")]
    MeshTimeout,
    #[error("ERROR:NOT_READY")]
    NotReady,
}

/// Parse a bridged command: `target ':' verb (':' value)?`, whitespace-insensitive,
/// case-insensitive tokens (spec §4.2).
pub fn parse_command(raw: &str) -> Result<ParsedCommand, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::NoCommand);
    }

    let mut parts = trimmed.split(':').map(|p| p.trim());
    let target_tok = parts.next().unwrap_or("");
    let verb_tok = parts.next().unwrap_or("");
    let value_tok = parts.next();

    if target_tok.is_empty() {
        return Err(Error::NoNodeId);
    }

    let target = if target_tok.eq_ignore_ascii_case("ALL") {
        Target::All
    } else {
        match target_tok.parse::<u16>() {
            Ok(0) => Target::SelfNode,
            Ok(id) => Target::Node(id),
            Err(_) => return Err(Error::InvalidNode),
        }
    };

    let verb = match verb_tok.to_ascii_uppercase().as_str() {
        "READ" => Verb::Read,
        "DUTY" => {
            let value = value_tok
                .and_then(|v| v.parse::<u32>().ok())
                .ok_or_else(|| Error::UnknownCmd(format!("DUTY:{}", value_tok.unwrap_or(""))))?;
            Verb::Duty(value.min(100) as u8)
        }
        "RAMP" => Verb::Ramp,
        "STOP" => Verb::Stop,
        "ON" => Verb::On,
        "OFF" => Verb::Off,
        "MONITOR" => Verb::Monitor,
        other => return Err(Error::UnknownCmd(other.to_string())),
    };

    Ok(ParsedCommand { target, verb })
}

/// Node-native short forms, only accepted when the executor is invoked locally
/// (not via the host bridge): `read`, `s`, `r`, `duty:N`, or a bare integer
/// (aliased to `duty:N`).
pub fn parse_local_shorthand(raw: &str) -> Option<ParsedCommand> {
    let trimmed = raw.trim();

    if trimmed.eq_ignore_ascii_case("read")
        || trimmed.eq_ignore_ascii_case("s")
        || trimmed.eq_ignore_ascii_case("r")
    {
        return Some(ParsedCommand {
            target: Target::SelfNode,
            verb: Verb::Read,
        });
    }

    if let Ok(percent) = trimmed.parse::<u32>() {
        return Some(ParsedCommand {
            target: Target::SelfNode,
            verb: Verb::Duty(percent.min(100) as u8),
        });
    }

    let lower = trimmed.to_ascii_lowercase();
    if let Some(value) = lower.strip_prefix("duty:") {
        let percent: u32 = value.trim().parse().ok()?;
        return Some(ParsedCommand {
            target: Target::SelfNode,
            verb: Verb::Duty(percent.min(100) as u8),
        });
    }

    None
}

/// `NODE<id>:DATA:D:<int>%,V:<float3>V,I:<float2>mA,P:<float1>mW` (spec §6).
/// `power_mW = |voltage * current_mA|`, always recomputed, never trusted as an
/// independent input (spec §3 `NodeStatus` invariant).
pub fn format_data_reply(node_id: u16, duty_percent: u8, voltage: f64, current_ma: f64) -> String {
    let power_mw = (voltage * current_ma).abs();
    format!(
        "NODE{}:DATA:D:{}%,V:{:.3}V,I:{:.2}mA,P:{:.1}mW",
        node_id, duty_percent, voltage, current_ma, power_mw
    )
}

/// `NODE<id>:ACK:<0|1>`.
pub fn format_ack(node_id: u16, on: bool) -> String {
    format!("NODE{}:ACK:{}", node_id, on as u8)
}

/// `NODE<id>:ONOFF:<0|1>`.
pub fn format_onoff(node_id: u16, on: bool) -> String {
    format!("NODE{}:ONOFF:{}", node_id, on as u8)
}

/// `TIMEOUT:0x<hex4>`.
pub fn format_timeout(addr: u16) -> String {
    format!("TIMEOUT:0x{:04X}", addr)
}

/// `SENT:<verb>` — acknowledgement of command acceptance by the bridge.
pub fn format_sent(verb: &str) -> String {
    format!("SENT:{}", verb)
}

/// `ERROR:<TAG>[:<detail>]`.
pub fn format_error(tag: &str, detail: Option<&str>) -> String {
    match detail {
        Some(detail) => format!("ERROR:{}:{}", tag, detail),
        None => format!("ERROR:{}", tag),
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::SelfNode => write!(f, "0"),
            Target::All => write!(f, "ALL"),
            Target::Node(id) => write!(f, "{}", id),
        }
    }
}

/// The host's side of the wire contract: a parsed notification line (spec §6).
/// Every variant mirrors one of the `format_*` functions above byte-for-byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Data {
        node_id: u16,
        duty_percent: u8,
        voltage: f64,
        current_ma: f64,
        power_mw: f64,
    },
    Ack {
        node_id: u16,
        on: bool,
    },
    OnOff {
        node_id: u16,
        on: bool,
    },
    Timeout {
        addr: u16,
    },
    Sent {
        verb: String,
    },
    Error {
        tag: String,
        detail: Option<String>,
    },
}

/// Parse one reassembled notification line from C3 into a [`Reply`]. Unrecognized
/// lines (malformed or from a future firmware revision) return `None` rather than
/// erroring — the host logs and drops them (spec §7 treats only specific shapes as
/// fatal, and an unparseable notification is not one of them).
pub fn parse_reply(line: &str) -> Option<Reply> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("NODE") {
        let (id_str, rest) = rest.split_once(':')?;
        let node_id: u16 = id_str.parse().ok()?;
        let (kind, rest) = rest.split_once(':')?;
        return match kind {
            "DATA" => parse_data_payload(node_id, rest),
            "ACK" => Some(Reply::Ack {
                node_id,
                on: rest.trim() == "1",
            }),
            "ONOFF" => Some(Reply::OnOff {
                node_id,
                on: rest.trim() == "1",
            }),
            _ => None,
        };
    }

    if let Some(rest) = line.strip_prefix("TIMEOUT:0x") {
        let addr = u16::from_str_radix(rest.trim(), 16).ok()?;
        return Some(Reply::Timeout { addr });
    }

    if let Some(verb) = line.strip_prefix("SENT:") {
        return Some(Reply::Sent {
            verb: verb.trim().to_string(),
        });
    }

    if let Some(rest) = line.strip_prefix("ERROR:") {
        let mut parts = rest.splitn(2, ':');
        let tag = parts.next()?.trim().to_string();
        let detail = parts.next().map(|d| d.trim().to_string());
        return Some(Reply::Error { tag, detail });
    }

    None
}

/// `D:<int>%,V:<float3>V,I:<float2>mA,P:<float1>mW` — the payload half of a
/// `DATA` reply. `power_mw` is parsed rather than recomputed here; the host
/// re-derives its own authoritative value from `voltage`/`current_ma` when it
/// updates `NodeStatus` (spec §3's "never trusted as an independent field"
/// invariant is enforced by the *caller*, not the parser).
fn parse_data_payload(node_id: u16, payload: &str) -> Option<Reply> {
    let mut duty_percent = None;
    let mut voltage = None;
    let mut current_ma = None;
    let mut power_mw = None;

    for field in payload.split(',') {
        let (key, value) = field.split_once(':')?;
        match key {
            "D" => duty_percent = value.trim_end_matches('%').parse::<u8>().ok(),
            "V" => voltage = value.trim_end_matches('V').parse::<f64>().ok(),
            "I" => current_ma = value.trim_end_matches("mA").parse::<f64>().ok(),
            "P" => power_mw = value.trim_end_matches("mW").parse::<f64>().ok(),
            _ => {}
        }
    }

    Some(Reply::Data {
        node_id,
        duty_percent: duty_percent?,
        voltage: voltage?,
        current_ma: current_ma?,
        power_mw: power_mw?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_read_for_self() {
        let cmd = parse_command("0:READ").unwrap();
        assert_eq!(cmd.target, Target::SelfNode);
        assert_eq!(cmd.verb, Verb::Read);
    }

    #[test]
    fn parses_group_read_case_and_space_insensitive() {
        let cmd = parse_command(" all : read ").unwrap();
        assert_eq!(cmd.target, Target::All);
        assert_eq!(cmd.verb, Verb::Read);
    }

    #[test]
    fn parses_duty_with_value() {
        let cmd = parse_command("1:DUTY:50").unwrap();
        assert_eq!(cmd.target, Target::Node(1));
        assert_eq!(cmd.verb, Verb::Duty(50));
    }

    #[test]
    fn duty_value_is_clamped_to_100() {
        let cmd = parse_command("1:DUTY:250").unwrap();
        assert_eq!(cmd.verb, Verb::Duty(100));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert_eq!(parse_command("   "), Err(Error::NoCommand));
    }

    #[test]
    fn missing_target_is_no_node_id() {
        assert_eq!(parse_command(":READ"), Err(Error::NoNodeId));
    }

    #[test]
    fn garbage_target_is_invalid_node() {
        assert_eq!(parse_command("abc:READ"), Err(Error::InvalidNode));
    }

    #[test]
    fn unknown_verb_reports_exact_tag() {
        match parse_command("0:FROB") {
            Err(Error::UnknownCmd(verb)) => assert_eq!(verb, "FROB"),
            other => panic!("expected UnknownCmd, got {:?}", other),
        }
    }

    #[test]
    fn data_reply_matches_byte_exact_scenario_s1() {
        // spec §8 scenario S1
        let reply = format_data_reply(0, 0, 12.003, 0.25);
        assert_eq!(reply, "NODE0:DATA:D:0%,V:12.003V,I:0.25mA,P:3.0mW");
    }

    #[test]
    fn local_shorthand_bare_integer_aliases_duty() {
        let cmd = parse_local_shorthand("75").unwrap();
        assert_eq!(cmd.target, Target::SelfNode);
        assert_eq!(cmd.verb, Verb::Duty(75));
    }

    #[test]
    fn local_shorthand_r_aliases_read() {
        let cmd = parse_local_shorthand("r").unwrap();
        assert_eq!(cmd.verb, Verb::Read);
    }

    #[test]
    fn error_display_is_byte_exact() {
        assert_eq!(Error::NoCommand.to_string(), "ERROR:NO_COMMAND");
        assert_eq!(Error::NotReady.to_string(), "ERROR:NOT_READY");
    }

    #[test]
    fn parses_data_reply_matching_scenario_s1() {
        let reply = parse_reply("NODE0:DATA:D:0%,V:12.003V,I:0.25mA,P:3.0mW").unwrap();
        assert_eq!(
            reply,
            Reply::Data {
                node_id: 0,
                duty_percent: 0,
                voltage: 12.003,
                current_ma: 0.25,
                power_mw: 3.0,
            }
        );
    }

    #[test]
    fn parses_sent_and_error_and_timeout() {
        assert_eq!(
            parse_reply("SENT:DUTY"),
            Some(Reply::Sent {
                verb: "DUTY".to_string()
            })
        );
        assert_eq!(
            parse_reply("ERROR:UNKNOWN_CMD:FROB"),
            Some(Reply::Error {
                tag: "UNKNOWN_CMD".to_string(),
                detail: Some("FROB".to_string()),
            })
        );
        assert_eq!(parse_reply("TIMEOUT:0x0008"), Some(Reply::Timeout { addr: 8 }));
    }

    #[test]
    fn malformed_reply_is_none() {
        assert_eq!(parse_reply("NODE:garbage"), None);
        assert_eq!(parse_reply("not a reply at all"), None);
    }
}
