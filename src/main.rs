mod p2pproxy;

use clap::{CommandFactory, Parser, error::ErrorKind};

use p2pproxy::config::{self, Mode};

#[derive(Debug, Parser)]
#[command(
    name = "p2pproxy",
    version,
    about = "p2pproxy - reverse TCP tunnel over a single multiplexed control channel"
)]
struct Cli {
    /// Run the public side: accept the control channel on --p2p and public connections on --server (default).
    #[arg(short = 's', long = "server-mode", conflicts_with_all = ["client", "mode"])]
    server_mode: bool,

    /// Run the NAT side: dial --p2p and relay to the backend at --server.
    #[arg(short = 'c', long = "client", conflicts_with = "mode")]
    client: bool,

    /// Role, as an alternative to -s/-c.
    #[arg(long, value_enum, env = "P2PPROXY_MODE")]
    mode: Option<Mode>,

    /// Control-channel address (HOST:PORT). Listened on in server mode, dialed in client mode.
    #[arg(long = "p2p", env = "P2PPROXY_P2P")]
    p2p: Option<String>,

    /// Public proxy address (server mode) or backend address (client mode), HOST:PORT.
    #[arg(long = "server", env = "P2PPROXY_SERVER")]
    server: Option<String>,

    /// Optional config file (.toml/.yaml/.yml). Command-line values win over the file.
    #[arg(long, env = "P2PPROXY_CONFIG")]
    config: Option<std::path::PathBuf>,
}

impl Cli {
    fn overrides(self) -> config::Overrides {
        let mode = if self.client {
            Some(Mode::Client)
        } else if self.server_mode {
            Some(Mode::Server)
        } else {
            self.mode
        };
        config::Overrides {
            mode,
            p2p_addr: self.p2p,
            server_addr: self.server,
            config_path: self.config,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = match config::load(cli.overrides()) {
        Ok(cfg) => cfg,
        Err(err) if err.is_usage() => Cli::command()
            .error(ErrorKind::ValueValidation, err.to_string())
            .exit(),
        Err(err) => return Err(err.into()),
    };
    p2pproxy::run(cfg).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn client_flag_selects_client_mode() {
        let cli = Cli::try_parse_from(["p2pproxy", "-c", "--p2p", "a:1", "--server", "b:2"]).unwrap();
        let o = cli.overrides();
        assert_eq!(o.mode, Some(Mode::Client));
        assert_eq!(o.p2p_addr.as_deref(), Some("a:1"));
        assert_eq!(o.server_addr.as_deref(), Some("b:2"));
    }

    #[test]
    fn role_flags_conflict() {
        assert!(Cli::try_parse_from(["p2pproxy", "-c", "-s"]).is_err());
    }
}
