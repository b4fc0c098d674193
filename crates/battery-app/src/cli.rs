use anyhow::{Context, Result};

use protocol::ModeConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Poll configured devices until interrupted.
    Run,
    /// Print discovered devices as JSON and exit.
    Discover,
    /// Apply a mode to one device and exit.
    SetMode { device: String, mode: ModeConfig },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub config_path: Option<String>,
    pub command: Command,
}

pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs> {
    let mut config_path = None;
    let mut command = Command::Run;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = Some(args.next().context("--config needs a path")?);
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config_path = Some(path.to_string());
        } else if arg == "--discover" {
            command = Command::Discover;
        } else if arg == "--mode" {
            let value = args.next().context("--mode needs <device>=<auto|ai>")?;
            command = parse_mode(&value)?;
        } else if let Some(value) = arg.strip_prefix("--mode=") {
            command = parse_mode(value)?;
        } else {
            anyhow::bail!("unknown argument: {arg}");
        }
    }

    Ok(CliArgs {
        config_path,
        command,
    })
}

fn parse_mode(value: &str) -> Result<Command> {
    let (device, mode) = value
        .rsplit_once('=')
        .context("--mode expects <device>=<auto|ai>")?;
    if device.trim().is_empty() {
        anyhow::bail!("--mode needs a device source tag");
    }
    let mode = match mode.trim().to_ascii_lowercase().as_str() {
        "auto" => ModeConfig::Auto,
        "ai" => ModeConfig::Ai,
        other => anyhow::bail!("unsupported mode '{other}', expected auto or ai"),
    };
    Ok(Command::SetMode {
        device: device.trim().to_string(),
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn defaults_to_daemon() {
        let parsed = parse_args(args(&[])).unwrap();
        assert_eq!(parsed.command, Command::Run);
        assert_eq!(parsed.config_path, None);
    }

    #[test]
    fn config_and_mode_flags() {
        let parsed = parse_args(args(&["--config", "/etc/battery.toml", "--mode", "VenusC-1=AI"])).unwrap();
        assert_eq!(parsed.config_path.as_deref(), Some("/etc/battery.toml"));
        assert_eq!(
            parsed.command,
            Command::SetMode {
                device: "VenusC-1".to_string(),
                mode: ModeConfig::Ai
            }
        );

        let parsed = parse_args(args(&["--config=b.json", "--discover"])).unwrap();
        assert_eq!(parsed.config_path.as_deref(), Some("b.json"));
        assert_eq!(parsed.command, Command::Discover);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(args(&["--mode", "VenusC-1=manual"])).is_err());
        assert!(parse_args(args(&["--mode", "=auto"])).is_err());
        assert!(parse_args(args(&["--config"])).is_err());
        assert!(parse_args(args(&["--verbose"])).is_err());
    }
}
