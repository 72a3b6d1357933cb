//! Text messages exchanged with workers.
//!
//! Messages are short XML-like fragments; a tag either appears as `<name/>`
//! or wraps a value as `<name>value</name>`.

use serde::{Deserialize, Serialize};

pub const MSG_SUSPEND: &str = "<suspend/>";
pub const MSG_RESUME: &str = "<resume/>";
pub const MSG_QUIT: &str = "<quit/>";
pub const MSG_ABORT: &str = "<abort/>";
pub const MSG_NETWORK_AVAILABLE: &str = "<network_available/>";
pub const MSG_HAVE_TRICKLE_DOWN: &str = "<have_trickle_down/>";
pub const MSG_HAVE_TRICKLE_UP: &str = "<have_new_trickle_up/>";

pub fn has_tag(msg: &str, tag: &str) -> bool {
    msg.contains(&format!("<{tag}/>")) || msg.contains(&format!("<{tag}>"))
}

pub fn parse_str<'a>(msg: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = msg.find(&open)? + open.len();
    let end = msg[start..].find(&close)? + start;
    Some(msg[start..end].trim())
}

pub fn parse_f64(msg: &str, tag: &str) -> Option<f64> {
    parse_str(msg, tag)?.parse().ok()
}

pub fn parse_bool(msg: &str, tag: &str) -> Option<bool> {
    if msg.contains(&format!("<{tag}/>")) {
        return Some(true);
    }
    match parse_str(msg, tag)? {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

/// Commands on the process-control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Suspend,
    Resume,
    Quit,
    Abort,
}

impl ControlCommand {
    pub fn as_msg(&self) -> &'static str {
        match self {
            ControlCommand::Suspend => MSG_SUSPEND,
            ControlCommand::Resume => MSG_RESUME,
            ControlCommand::Quit => MSG_QUIT,
            ControlCommand::Abort => MSG_ABORT,
        }
    }

    pub fn parse(msg: &str) -> Option<Self> {
        [
            ControlCommand::Abort,
            ControlCommand::Quit,
            ControlCommand::Suspend,
            ControlCommand::Resume,
        ]
        .into_iter()
        .find(|cmd| msg.contains(cmd.as_msg()))
    }
}

/// Legacy graphics modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphicsMode {
    #[default]
    Unsupported,
    HideGraphics,
    Window,
    Fullscreen,
    Blankscreen,
}

impl GraphicsMode {
    const ALL: [GraphicsMode; 5] = [
        GraphicsMode::Unsupported,
        GraphicsMode::HideGraphics,
        GraphicsMode::Window,
        GraphicsMode::Fullscreen,
        GraphicsMode::Blankscreen,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            GraphicsMode::Unsupported => "mode_unsupported",
            GraphicsMode::HideGraphics => "mode_hide_graphics",
            GraphicsMode::Window => "mode_window",
            GraphicsMode::Fullscreen => "mode_fullscreen",
            GraphicsMode::Blankscreen => "mode_blankscreen",
        }
    }

    pub fn as_msg(&self) -> String {
        format!("<{}/>", self.tag())
    }

    pub fn parse(msg: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| has_tag(msg, mode.tag()))
    }
}

/// Contents of an app_status message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppStatus {
    pub current_cpu_time: Option<f64>,
    pub checkpoint_cpu_time: Option<f64>,
    pub fraction_done: Option<f64>,
    pub working_set_size: Option<f64>,
    pub want_network: Option<bool>,
    pub trickle_up: bool,
}

impl AppStatus {
    pub fn parse(msg: &str) -> Self {
        Self {
            current_cpu_time: parse_f64(msg, "current_cpu_time"),
            checkpoint_cpu_time: parse_f64(msg, "checkpoint_cpu_time"),
            fraction_done: parse_f64(msg, "fraction_done"),
            working_set_size: parse_f64(msg, "working_set_size"),
            want_network: parse_bool(msg, "want_network"),
            trickle_up: has_tag(msg, "have_new_trickle_up"),
        }
    }

    pub fn to_msg(&self) -> String {
        let mut msg = String::new();
        if let Some(v) = self.current_cpu_time {
            msg.push_str(&format!("<current_cpu_time>{v:.6}</current_cpu_time>"));
        }
        if let Some(v) = self.checkpoint_cpu_time {
            msg.push_str(&format!("<checkpoint_cpu_time>{v:.6}</checkpoint_cpu_time>"));
        }
        if let Some(v) = self.fraction_done {
            msg.push_str(&format!("<fraction_done>{v:.6}</fraction_done>"));
        }
        if let Some(v) = self.working_set_size {
            msg.push_str(&format!("<working_set_size>{v:.0}</working_set_size>"));
        }
        if let Some(v) = self.want_network {
            msg.push_str(&format!("<want_network>{}</want_network>", u8::from(v)));
        }
        if self.trickle_up {
            msg.push_str(MSG_HAVE_TRICKLE_UP);
        }
        msg
    }
}

pub fn heartbeat_msg(wss: f64, max_wss: f64, network_available: bool) -> String {
    let mut msg = format!("<heartbeat/><wss>{wss:.0}</wss><max_wss>{max_wss:.0}</max_wss>");
    if network_available {
        msg.push_str(MSG_NETWORK_AVAILABLE);
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_report() {
        let status = AppStatus::parse(
            "<current_cpu_time>12.5</current_cpu_time>\
             <checkpoint_cpu_time>10</checkpoint_cpu_time>\
             <fraction_done>0.25</fraction_done>\
             <want_network>1</want_network>",
        );
        assert_eq!(status.current_cpu_time, Some(12.5));
        assert_eq!(status.checkpoint_cpu_time, Some(10.0));
        assert_eq!(status.fraction_done, Some(0.25));
        assert_eq!(status.want_network, Some(true));
        assert!(!status.trickle_up);
    }

    #[test]
    fn status_message_is_readable_back() {
        let status = AppStatus {
            current_cpu_time: Some(3.0),
            fraction_done: Some(0.5),
            trickle_up: true,
            ..AppStatus::default()
        };
        let parsed = AppStatus::parse(&status.to_msg());
        assert_eq!(parsed.current_cpu_time, Some(3.0));
        assert!(parsed.trickle_up);
        assert_eq!(parsed.checkpoint_cpu_time, None);
    }

    #[test]
    fn control_commands_match_wire_text() {
        assert_eq!(ControlCommand::parse("<quit/>"), Some(ControlCommand::Quit));
        assert_eq!(ControlCommand::parse("<resume/>"), Some(ControlCommand::Resume));
        assert_eq!(ControlCommand::parse("<bogus/>"), None);
    }

    #[test]
    fn graphics_mode_tags() {
        assert_eq!(GraphicsMode::Window.as_msg(), "<mode_window/>");
        assert_eq!(
            GraphicsMode::parse("<current_graphics_mode><mode_fullscreen/></current_graphics_mode>"),
            Some(GraphicsMode::Fullscreen)
        );
    }

    #[test]
    fn heartbeat_carries_network_flag() {
        assert!(heartbeat_msg(1.0, 2.0, true).ends_with(MSG_NETWORK_AVAILABLE));
        assert_eq!(heartbeat_msg(1.0, 2.0, false), "<heartbeat/><wss>1</wss><max_wss>2</max_wss>");
    }

    #[test]
    fn bool_accepts_empty_tag() {
        assert_eq!(parse_bool("<want_network/>", "want_network"), Some(true));
        assert_eq!(parse_bool("<want_network>0</want_network>", "want_network"), Some(false));
    }
}
