use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "atelier",
    version,
    about = "Inspect, verify and recover Atelier project files"
)]
pub struct Cli {
    /// Engine configuration (JSON). Defaults apply when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the manifest of a project without loading its body.
    Info {
        file: PathBuf,
        /// Print the manifest as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Decode a project, check every asset checksum and load it.
    Verify { file: PathBuf },
    /// Write a project as an archive directory: the project stream plus asset files.
    Unpack { file: PathBuf, out_dir: PathBuf },
    /// Composite the visible layers into a PNG.
    Flatten { file: PathBuf, out: PathBuf },
    /// List or restore recovery points of a file-backed autosave store.
    Recover {
        /// Directory of the autosave store.
        store: PathBuf,
        /// Restore this recovery point (default: the latest).
        #[arg(long, value_name = "ID")]
        point: Option<String>,
        /// Write the restored project here. Without it, points are only listed.
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Print the effective configuration.
    Config,
}
