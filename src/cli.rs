use std::{net::SocketAddr, time::Duration};

use clap::{builder::PossibleValuesParser, ArgAction, Parser};
use transocks::{
    config::{self, parse_addr_port, Config},
    pump, transparent,
};

#[derive(Parser)]
#[command(
    name = "transocks",
    version,
    about = "Transparently relay redirected TCP connections through a SOCKS5 server"
)]
pub struct Cli {
    /// Address and port redirected TCP connections arrive on
    #[arg(long, value_name = "ADDR:PORT", value_parser = parse_addr_port)]
    pub tcp_listener_addr_port: SocketAddr,

    /// Address and port redirected UDP datagrams arrive on
    #[arg(long, value_name = "ADDR:PORT", value_parser = parse_addr_port)]
    pub udp_listener_addr_port: SocketAddr,

    /// Address and port of the upstream SOCKS5 server
    #[arg(long = "socks5-addr-port", value_name = "ADDR:PORT", value_parser = parse_addr_port)]
    pub relay_addr_port: SocketAddr,

    /// How bytes are relayed: buffer, or splice on Linux
    #[arg(
        long,
        value_name = "NAME",
        num_args = 0..=1,
        require_equals = true,
        default_value = config::DEFAULT_PUMP_METHOD,
        default_missing_value = config::DEFAULT_PUMP_METHOD,
        value_parser = PossibleValuesParser::new(pump::METHOD_NAMES)
    )]
    pub pump_method: String,

    /// How the original destination is recovered: redirect or tproxy
    #[arg(
        long,
        value_name = "NAME",
        default_value = config::DEFAULT_TRANSPARENT_METHOD,
        value_parser = PossibleValuesParser::new(transparent::METHOD_NAMES)
    )]
    pub transparent_method: String,

    /// Seconds allowed for connecting to the relay and the SOCKS5 handshake
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = config::DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub handshake_timeout: u64,

    /// Close connections idle for this many seconds
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub idle_timeout: Option<u64>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn into_config(self) -> Config {
        let mut config = Config::new(
            self.tcp_listener_addr_port,
            self.udp_listener_addr_port,
            self.relay_addr_port,
        );
        config.pump_method = self.pump_method;
        config.transparent_method = self.transparent_method;
        config.handshake_timeout = Duration::from_secs(self.handshake_timeout);
        config.idle_timeout = self.idle_timeout.map(Duration::from_secs);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 4] = [
        "transocks",
        "--tcp-listener-addr-port=127.0.0.1:12345",
        "--udp-listener-addr-port=127.0.0.1:12345",
        "--socks5-addr-port=127.0.0.1:1080",
    ];

    fn parse(extra: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(REQUIRED.iter().chain(extra))
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap().into_config();
        assert_eq!(config.relay_addr, "127.0.0.1:1080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.pump_method, "buffer");
        assert_eq!(config.transparent_method, "redirect");
        assert_eq!(config.handshake_timeout, Duration::from_secs(60));
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn bare_pump_method_means_default() {
        assert_eq!(parse(&["--pump-method"]).unwrap().pump_method, "buffer");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn splice_is_selectable() {
        assert_eq!(
            parse(&["--pump-method=splice"]).unwrap().pump_method,
            "splice"
        );
    }

    #[test]
    fn unknown_method_names_are_usage_errors() {
        let err = parse(&["--pump-method=teleport"]).err().unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);

        let err = parse(&["--transparent-method=divert"]).err().unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);

        let tproxy = parse(&["--transparent-method=tproxy"]).unwrap();
        assert_eq!(tproxy.transparent_method, "tproxy");
    }

    #[test]
    fn timeouts() {
        let config = parse(&["--handshake-timeout=5", "--idle-timeout=30"])
            .unwrap()
            .into_config();
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert!(parse(&["--handshake-timeout=0"]).is_err());
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(Cli::try_parse_from(&REQUIRED[..3]).is_err());
        let zero_port = [REQUIRED[0], REQUIRED[1], REQUIRED[2], "--socks5-addr-port=127.0.0.1:0"];
        assert!(Cli::try_parse_from(zero_port).is_err());
    }

    #[test]
    fn verbosity_counts() {
        assert_eq!(parse(&["-vv"]).unwrap().verbose, 2);
    }
}
