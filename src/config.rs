//! CLI surface and runtime configuration.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "meshtastic-gem-proxy",
    about = "Multi-client TCP proxy in front of a Meshtastic radio, with /gem AI command interception"
)]
pub struct Cli {
    /// Bind address for the client-facing server.
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Bind port for the client-facing server.
    #[arg(long, default_value_t = 4404)]
    pub listen_port: u16,

    /// Meshtastic radio host.
    #[arg(long, default_value = "192.168.2.144")]
    pub radio_host: String,

    /// Meshtastic radio port.
    #[arg(long, default_value_t = 4403)]
    pub radio_port: u16,

    /// Default channel index used for injected responses when the source
    /// channel is unavailable.
    #[arg(long, default_value_t = 2)]
    pub channel: u32,

    /// Seconds to wait before injecting a generated response.
    #[arg(long = "response-delay", default_value_t = 2.0)]
    pub response_delay: f64,

    /// Verbose diagnostics.
    #[arg(long)]
    pub debug: bool,
}

/// Resolved configuration handed to the orchestrator. A thin wrapper over
/// `Cli` today; kept distinct so future non-CLI configuration sources
/// (env, file) can populate the same shape without touching the clap type.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub radio_host: String,
    pub radio_port: u16,
    pub channel: u32,
    pub response_delay: f64,
    pub debug: bool,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            listen_host: cli.listen_host,
            listen_port: cli.listen_port,
            radio_host: cli.radio_host,
            radio_port: cli.radio_port,
            channel: cli.channel,
            response_delay: cli.response_delay,
            debug: cli.debug,
        }
    }
}
