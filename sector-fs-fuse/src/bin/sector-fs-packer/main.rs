mod cli;

use std::io::{self, Write};

use clap::Parser;
use cli::{Cli, Command};

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Pack { sectors, files } => {
            println!("image={:?}\nsectors={sectors}", cli.image);
            let inodes = sector_fs_fuse::pack(&cli.image, sectors, &files)?;
            for (sector, path) in inodes.into_iter().zip(&files) {
                println!("{sector}\t{}", path.display());
            }
        }
        Command::Cat { sector } => {
            let data = sector_fs_fuse::cat(&cli.image, sector)?;
            io::stdout().write_all(&data)?;
        }
    }

    Ok(())
}
