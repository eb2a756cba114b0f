// qpx command-line arguments
// (c) 2024 Ross Younger

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(
    author,
    version,
    about,
    before_help = "e.g.   qpx --config client.toml",
    infer_long_args(true)
)]
#[command(styles(super::styles::CLAP_STYLES))]
pub(crate) struct CliArgs {
    /// Configuration file (TOML)
    ///
    /// Settings given on the command line take precedence over the file.
    #[arg(short, long, value_name("FILE"))]
    pub config: Option<PathBuf>,

    /// Server address (host:port)
    #[arg(short, long, value_name("HOST:PORT"), help_heading("Connection"))]
    pub server: Option<String>,

    /// SOCKS5 listen address, e.g. 127.0.0.1:1080
    #[arg(long, value_name("ADDR"), help_heading("Front-ends"))]
    pub socks5: Option<String>,

    /// HTTP proxy listen address, e.g. 127.0.0.1:8080
    #[arg(long, value_name("ADDR"), help_heading("Front-ends"))]
    pub http: Option<String>,

    /// Skips TLS certificate verification of the server. _Testing only!_
    #[arg(long, action, help_heading("Connection"))]
    pub insecure: bool,

    /// Enable detailed debug output
    #[arg(short, long, action, conflicts_with("quiet"))]
    pub debug: bool,

    /// Quiet mode: report only errors
    #[arg(short, long, action)]
    pub quiet: bool,
}
