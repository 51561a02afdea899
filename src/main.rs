//! Virial coefficient command-line interface

use color_eyre::eyre::Result;
use virial::app::VirialApplication;

fn main() -> Result<()> {
    color_eyre::install()?;
    VirialApplication::from_cli()?.run()
}
