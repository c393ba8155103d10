use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
pub struct Cli {
    /// Disk image
    #[arg(long, short)]
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Format the image and copy host files into it
    Pack {
        /// Image size in sectors
        #[arg(long, short, default_value_t = 16 * 2048)]
        sectors: usize,

        /// Host files to copy
        files: Vec<PathBuf>,
    },

    /// Print the file whose inode lives at the given sector
    Cat { sector: u32 },
}
