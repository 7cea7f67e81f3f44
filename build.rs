//! Build script rendering the `orka-runner` manual pages.
//!
//! One page covers the top-level command and each subcommand gets its own
//! `orka-runner-<name>.1` page in the build output directory.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const BIN: &str = "orka-runner";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let command = Cli::command();
    render(&out_dir, BIN, Man::new(command.clone()))?;
    for subcommand in command.get_subcommands() {
        let page = format!("{BIN}-{}", subcommand.get_name());
        render(&out_dir, &page, Man::new(subcommand.clone()).title(page.clone()))?;
    }

    Ok(())
}

fn render(out_dir: &Path, page: &str, man: Man) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    fs::write(out_dir.join(format!("{page}.1")), buffer)?;
    Ok(())
}
