use clap::Parser;

/// CLI overrides for the control plane daemon: a small `clap::Parser`
/// struct that overrides the more commonly-tweaked environment variables.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listening host
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Listening port
    #[arg(short, long, default_value_t = 8968)]
    pub port: u16,

    /// Data directory holding uploaded images, per-device directories and
    /// the KVS file. Falls back to `DATA_DIR` then `/data`.
    #[arg(long)]
    pub data_dir: Option<String>,
}
