// Command line for the relay binary.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(
    name = "uh-relay",
    about = "Relay Ultrahaptics SDK control-point telemetry to a buffer and WebSocket subscribers",
    version
)]
pub struct CliArgs {
    #[arg(
        short = 'e',
        long = "exe",
        value_name = "PATH",
        help = "Executable to monitor"
    )]
    pub exe: Option<PathBuf>,

    #[arg(
        short = 'a',
        long = "auto-launch",
        requires = "exe",
        help = "Launch the executable once the channel is ready"
    )]
    pub auto_launch: bool,

    #[arg(
        long = "kill-on-exit",
        help = "Kill the launched executable when the relay stops"
    )]
    pub kill_on_exit: bool,

    #[arg(
        short = 'c',
        long = "config",
        value_name = "PATH",
        help = "JSON configuration file"
    )]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(list: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("uh-relay").chain(list.iter().copied()))
    }

    #[test]
    fn test_no_args() {
        assert_eq!(parse(&[]).unwrap(), CliArgs::default());
    }

    #[test]
    fn test_launch_flags() {
        let parsed = parse(&["-e", "app/demo.exe", "-a", "--kill-on-exit"]).unwrap();
        assert_eq!(parsed.exe, Some(PathBuf::from("app/demo.exe")));
        assert!(parsed.auto_launch);
        assert!(parsed.kill_on_exit);
    }

    #[test]
    fn test_long_forms() {
        let parsed = parse(&["--config", "relay.json", "--exe", "demo"]).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("relay.json")));
        assert_eq!(parsed.exe, Some(PathBuf::from("demo")));
        assert!(!parsed.auto_launch);
    }

    #[test]
    fn test_missing_value() {
        assert!(parse(&["-e"]).is_err());
    }

    #[test]
    fn test_auto_launch_needs_exe() {
        let err = parse(&["-a"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_unknown_argument() {
        let err = parse(&["--verbose"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_command_definition() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }
}
