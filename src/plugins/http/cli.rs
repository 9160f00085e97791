use crate::core::config::DEFAULT_USER_AGENT;
use crate::plugins::registry::{CliPlugin, DownloadCliConfig};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;

pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn augment_download_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_header")
                .long("header")
                .help_heading("HTTP")
                .help("Extra HTTP header for every link (repeatable), e.g. --header 'Cookie: a=b'")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("HTTP User-Agent")
                .default_value(DEFAULT_USER_AGENT)
                .num_args(1),
        )
        .arg(
            Arg::new("http_connect_timeout_secs")
                .long("connect-timeout-secs")
                .help_heading("HTTP")
                .help("Connect timeout in seconds")
                .default_value("10")
                .num_args(1),
        )
    }

    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            cfg.engine.user_agent = ua.clone();
        }
        if let Some(s) = matches.get_one::<String>("http_connect_timeout_secs") {
            cfg.engine.connect_timeout = Duration::from_secs(s.parse()?);
        }

        if let Some(values) = matches.get_many::<String>("http_header") {
            for h in values {
                let (k, v) = h
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("invalid header format: {}", h))?;
                cfg.headers.insert(k.trim().to_string(), v.trim().to_string());
            }
        }

        Ok(())
    }
}
