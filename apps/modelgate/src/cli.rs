use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "modelgate",
    about = "LLM gateway: key admission, dialect translation, usage settlement"
)]
pub struct Cli {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    /// Bind port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
}
