use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pollcast-server", about = "Real-time poll voting server")]
pub struct Args {
    /// Path to the TOML configuration file. Defaults apply when it is missing.
    #[arg(short, long, default_value = "pollcast.toml")]
    pub config: String,
}
